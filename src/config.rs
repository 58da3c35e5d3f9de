use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    /// Label of the outermost program fragment.
    #[serde(default = "default_entry_label")]
    pub entry_label: String,
    /// Assembler directive opening the string-literal section.
    #[serde(default = "default_data_section")]
    pub data_section: String,
    /// Upper bound on build-color-rewrite rounds per procedure. The
    /// allocator provably terminates well below this; exceeding it is
    /// reported as a fatal bug.
    #[serde(default = "default_max_alloc_rounds")]
    pub max_alloc_rounds: usize,
}

fn default_entry_label() -> String {
    "tigermain".to_string()
}

fn default_data_section() -> String {
    ".data".to_string()
}

fn default_max_alloc_rounds() -> usize {
    64
}

impl Default for Options {
    fn default() -> Self {
        Options {
            entry_label: default_entry_label(),
            data_section: default_data_section(),
            max_alloc_rounds: default_max_alloc_rounds(),
        }
    }
}

impl Options {
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let options: Options = toml::from_str(&content)?;
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_apply_to_missing_fields() {
        let options: Options = toml::from_str("entry_label = \"main\"").unwrap();
        assert_eq!(options.entry_label, "main");
        assert_eq!(options.data_section, ".data");
        assert_eq!(options.max_alloc_rounds, 64);
    }

    #[test]
    fn round_trips_through_a_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "data_section = \".rodata\"").unwrap();
        let options = Options::from_file(file.path()).unwrap();
        assert_eq!(options.data_section, ".rodata");
        assert_eq!(options.entry_label, "tigermain");
    }
}
