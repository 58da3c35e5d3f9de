use anyhow::{Context as _, Result};
use clap::Parser;
use std::cell::Cell;
use std::path::PathBuf;
use tigerc::ast::{Dec, Exp, Field, FunDec, Oper};
use tigerc::symbol::Symbol;
use tigerc::{compile_to_string, Options};

/// The scanner and parser live in the front end; this driver compiles
/// one of a few built-in typed programs so the back end can be exercised
/// on its own.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Built-in program to compile: factorial, nested, or loop
    #[arg(short, long, default_value = "factorial")]
    demo: String,

    /// Path of the generated assembly file
    #[arg(short, long)]
    output: PathBuf,

    /// Optional TOML options file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let options = match &args.config {
        Some(path) => Options::from_file(path).context("failed to read options file")?,
        None => Options::default(),
    };

    let program =
        demo_program(&args.demo).ok_or_else(|| anyhow::anyhow!("unknown demo `{}`", args.demo))?;
    let assembly = compile_to_string(&program, &options)
        .map_err(|e| anyhow::anyhow!("compilation failed: {e}"))?;
    std::fs::write(&args.output, assembly)
        .with_context(|| format!("failed to write {}", args.output.display()))?;
    println!("wrote {}", args.output.display());
    Ok(())
}

fn demo_program(name: &str) -> Option<Exp> {
    match name {
        "factorial" => Some(factorial()),
        "nested" => Some(nested()),
        "loop" => Some(counting_loop()),
        _ => None,
    }
}

/// let function fact(n: int): int =
///   if n = 0 then 1 else n * fact(n - 1)
/// in printi(fact(5)) end
fn factorial() -> Exp {
    let body = Exp::If {
        test: Box::new(Exp::op(Oper::Eq, Exp::simple_var("n"), Exp::Int(0))),
        then: Box::new(Exp::Int(1)),
        els: Some(Box::new(Exp::op(
            Oper::Times,
            Exp::simple_var("n"),
            Exp::call(
                "fact",
                vec![Exp::op(Oper::Minus, Exp::simple_var("n"), Exp::Int(1))],
            ),
        ))),
    };
    Exp::Let {
        decs: vec![Dec::Functions(vec![FunDec {
            name: Symbol::new("fact"),
            params: vec![Field::new("n", "int")],
            result: Some(Symbol::new("int")),
            body,
        }])],
        body: Box::new(Exp::call(
            "printi",
            vec![Exp::call("fact", vec![Exp::Int(5)])],
        )),
    }
}

/// let function g(x: int): int =
///   let function h(): int = x in h() end
/// in printi(g(7)) end
fn nested() -> Exp {
    let h = FunDec {
        name: Symbol::new("h"),
        params: vec![],
        result: Some(Symbol::new("int")),
        body: Exp::simple_var("x"),
    };
    let g = FunDec {
        name: Symbol::new("g"),
        params: vec![Field::new("x", "int")],
        result: Some(Symbol::new("int")),
        body: Exp::Let {
            decs: vec![Dec::Functions(vec![h])],
            body: Box::new(Exp::call("h", vec![])),
        },
    };
    Exp::Let {
        decs: vec![Dec::Functions(vec![g])],
        body: Box::new(Exp::call("printi", vec![Exp::call("g", vec![Exp::Int(7)])])),
    }
}

/// for i := 1 to 10 do printi(i)
fn counting_loop() -> Exp {
    Exp::For {
        var: Symbol::new("i"),
        escape: Cell::new(false),
        lo: Box::new(Exp::Int(1)),
        hi: Box::new(Exp::Int(10)),
        body: Box::new(Exp::call("printi", vec![Exp::simple_var("i")])),
    }
}
