//! Iterated graph coloring with conservative coalescing. One run either
//! produces a complete assignment of temporaries to machine registers or
//! a list of nodes to spill, in which case the allocator rewrites the
//! program and runs again on a fresh graph.

use std::collections::VecDeque;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::trace;

use crate::frame::x64;
use crate::liveness::InterferenceGraph;
use crate::temp::Temp;

pub struct ColorResult {
    /// Final register (as a precolored temp) for every node that got one.
    pub coloring: FxHashMap<Temp, Temp>,
    pub spills: Vec<Temp>,
}

pub fn color(graph: &InterferenceGraph, not_spill: &FxHashSet<Temp>) -> ColorResult {
    Colorer::new(graph, not_spill).run()
}

type Move = (Temp, Temp);

struct Colorer<'a> {
    not_spill: &'a FxHashSet<Temp>,
    k: usize,
    precolored: FxHashSet<Temp>,

    simplify_worklist: Vec<Temp>,
    freeze_worklist: Vec<Temp>,
    spill_worklist: Vec<Temp>,
    spilled: Vec<Temp>,
    coalesced: FxHashSet<Temp>,
    colored: FxHashSet<Temp>,
    select_stack: Vec<Temp>,

    worklist_moves: VecDeque<Move>,
    active_moves: FxHashSet<Move>,
    coalesced_moves: FxHashSet<Move>,
    constrained_moves: FxHashSet<Move>,
    frozen_moves: FxHashSet<Move>,

    adj_set: FxHashSet<(Temp, Temp)>,
    adj_list: FxHashMap<Temp, FxHashSet<Temp>>,
    degree: FxHashMap<Temp, usize>,
    move_list: FxHashMap<Temp, Vec<Move>>,
    alias: FxHashMap<Temp, Temp>,
    color: FxHashMap<Temp, Temp>,
}

fn remove_item(list: &mut Vec<Temp>, t: Temp) -> bool {
    match list.iter().position(|&x| x == t) {
        Some(pos) => {
            list.remove(pos);
            true
        }
        None => false,
    }
}

fn push_unique(list: &mut Vec<Temp>, t: Temp) {
    if !list.contains(&t) {
        list.push(t);
    }
}

impl<'a> Colorer<'a> {
    fn new(graph: &InterferenceGraph, not_spill: &'a FxHashSet<Temp>) -> Self {
        // The stack pointer is fixed like the machine registers but never
        // part of the fifteen-color palette.
        let mut precolored: FxHashSet<Temp> = x64::REGISTERS.iter().copied().collect();
        precolored.insert(x64::RSP);
        let mut c = Colorer {
            not_spill,
            k: x64::K,
            precolored,
            simplify_worklist: Vec::new(),
            freeze_worklist: Vec::new(),
            spill_worklist: Vec::new(),
            spilled: Vec::new(),
            coalesced: FxHashSet::default(),
            colored: FxHashSet::default(),
            select_stack: Vec::new(),
            worklist_moves: VecDeque::new(),
            active_moves: FxHashSet::default(),
            coalesced_moves: FxHashSet::default(),
            constrained_moves: FxHashSet::default(),
            frozen_moves: FxHashSet::default(),
            adj_set: FxHashSet::default(),
            adj_list: FxHashMap::default(),
            degree: FxHashMap::default(),
            move_list: FxHashMap::default(),
            alias: FxHashMap::default(),
            color: FxHashMap::default(),
        };
        for &reg in &x64::REGISTERS {
            c.color.insert(reg, reg);
        }
        c.color.insert(x64::RSP, x64::RSP);
        for &(src, dst) in &graph.moves {
            c.move_list.entry(src).or_default().push((src, dst));
            if src != dst {
                c.move_list.entry(dst).or_default().push((src, dst));
            }
            c.worklist_moves.push_back((src, dst));
        }
        for (a, b) in graph.edges() {
            c.add_edge(a, b);
        }
        for &node in &graph.nodes {
            if c.precolored.contains(&node) {
                continue;
            }
            if c.degree_of(node) >= c.k {
                c.spill_worklist.push(node);
            } else if c.move_related(node) {
                c.freeze_worklist.push(node);
            } else {
                c.simplify_worklist.push(node);
            }
        }
        c
    }

    fn run(mut self) -> ColorResult {
        loop {
            if !self.simplify_worklist.is_empty() {
                self.simplify();
            } else if !self.worklist_moves.is_empty() {
                self.coalesce();
            } else if !self.freeze_worklist.is_empty() {
                self.freeze();
            } else if !self.spill_worklist.is_empty() {
                self.select_spill();
            } else {
                break;
            }
        }
        self.assign_colors();
        trace!(
            colored = self.colored.len(),
            coalesced = self.coalesced.len(),
            spilled = self.spilled.len(),
            "coloring finished"
        );
        ColorResult {
            coloring: self.color,
            spills: self.spilled,
        }
    }

    fn degree_of(&self, t: Temp) -> usize {
        self.degree.get(&t).copied().unwrap_or(0)
    }

    fn significant(&self, t: Temp) -> bool {
        self.precolored.contains(&t) || self.degree_of(t) >= self.k
    }

    fn add_edge(&mut self, u: Temp, v: Temp) {
        if u == v || self.adj_set.contains(&(u, v)) {
            return;
        }
        self.adj_set.insert((u, v));
        self.adj_set.insert((v, u));
        if !self.precolored.contains(&u) {
            self.adj_list.entry(u).or_default().insert(v);
            *self.degree.entry(u).or_insert(0) += 1;
        }
        if !self.precolored.contains(&v) {
            self.adj_list.entry(v).or_default().insert(u);
            *self.degree.entry(v).or_insert(0) += 1;
        }
    }

    /// Neighbors still in play: not simplified away, not coalesced.
    fn adjacent(&self, n: Temp) -> Vec<Temp> {
        match self.adj_list.get(&n) {
            Some(set) => set
                .iter()
                .copied()
                .filter(|t| !self.select_stack.contains(t) && !self.coalesced.contains(t))
                .collect(),
            None => Vec::new(),
        }
    }

    fn node_moves(&self, n: Temp) -> Vec<Move> {
        match self.move_list.get(&n) {
            Some(list) => list
                .iter()
                .copied()
                .filter(|m| self.active_moves.contains(m) || self.worklist_moves.contains(m))
                .collect(),
            None => Vec::new(),
        }
    }

    fn move_related(&self, n: Temp) -> bool {
        !self.node_moves(n).is_empty()
    }

    fn simplify(&mut self) {
        let n = self
            .simplify_worklist
            .pop()
            .expect("simplify with empty worklist");
        self.select_stack.push(n);
        for m in self.adjacent(n) {
            self.decrement_degree(m);
        }
    }

    fn decrement_degree(&mut self, m: Temp) {
        if self.precolored.contains(&m) {
            return;
        }
        let d = self.degree_of(m);
        if d > 0 {
            self.degree.insert(m, d - 1);
        }
        if d == self.k {
            let mut nodes = self.adjacent(m);
            nodes.push(m);
            self.enable_moves(&nodes);
            remove_item(&mut self.spill_worklist, m);
            if self.move_related(m) {
                push_unique(&mut self.freeze_worklist, m);
            } else {
                push_unique(&mut self.simplify_worklist, m);
            }
        }
    }

    fn enable_moves(&mut self, nodes: &[Temp]) {
        for &n in nodes {
            for m in self.node_moves(n) {
                if self.active_moves.remove(&m) {
                    self.worklist_moves.push_back(m);
                }
            }
        }
    }

    fn add_work_list(&mut self, u: Temp) {
        if !self.precolored.contains(&u) && !self.move_related(u) && self.degree_of(u) < self.k {
            remove_item(&mut self.freeze_worklist, u);
            push_unique(&mut self.simplify_worklist, u);
        }
    }

    /// George: every live neighbor of `v` must already get along with the
    /// precolored `u`.
    fn ok(&self, t: Temp, u: Temp) -> bool {
        self.degree_of(t) < self.k
            || self.precolored.contains(&t)
            || self.adj_set.contains(&(t, u))
    }

    /// Briggs: the combined node must leave fewer than K neighbors of
    /// significant degree.
    fn conservative(&self, nodes: &FxHashSet<Temp>) -> bool {
        nodes.iter().filter(|&&n| self.significant(n)).count() < self.k
    }

    fn get_alias(&self, n: Temp) -> Temp {
        let mut cur = n;
        while self.coalesced.contains(&cur) {
            cur = self.alias[&cur];
        }
        cur
    }

    fn coalesce(&mut self) {
        let m = self
            .worklist_moves
            .pop_front()
            .expect("coalesce with no moves");
        let (src, dst) = m;
        let x = self.get_alias(src);
        let y = self.get_alias(dst);
        let (u, v) = if self.precolored.contains(&y) {
            (y, x)
        } else {
            (x, y)
        };
        if u == v {
            self.coalesced_moves.insert(m);
            self.add_work_list(u);
        } else if self.precolored.contains(&v) || self.adj_set.contains(&(u, v)) {
            self.constrained_moves.insert(m);
            self.add_work_list(u);
            self.add_work_list(v);
        } else {
            let safe = if self.precolored.contains(&u) {
                self.adjacent(v).into_iter().all(|t| self.ok(t, u))
            } else {
                let mut combined: FxHashSet<Temp> = self.adjacent(u).into_iter().collect();
                combined.extend(self.adjacent(v));
                self.conservative(&combined)
            };
            if safe {
                self.coalesced_moves.insert(m);
                self.combine(u, v);
                self.add_work_list(u);
            } else {
                self.active_moves.insert(m);
            }
        }
    }

    fn combine(&mut self, u: Temp, v: Temp) {
        if !remove_item(&mut self.freeze_worklist, v) {
            remove_item(&mut self.spill_worklist, v);
        }
        self.coalesced.insert(v);
        self.alias.insert(v, u);
        let v_moves = self.move_list.get(&v).cloned().unwrap_or_default();
        let u_moves = self.move_list.entry(u).or_default();
        for m in v_moves {
            if !u_moves.contains(&m) {
                u_moves.push(m);
            }
        }
        self.enable_moves(&[v]);
        for t in self.adjacent(v) {
            self.add_edge(t, u);
            self.decrement_degree(t);
        }
        if self.degree_of(u) >= self.k && remove_item(&mut self.freeze_worklist, u) {
            push_unique(&mut self.spill_worklist, u);
        }
    }

    fn freeze(&mut self) {
        let u = self.freeze_worklist.remove(0);
        push_unique(&mut self.simplify_worklist, u);
        self.freeze_moves(u);
    }

    fn freeze_moves(&mut self, u: Temp) {
        for m in self.node_moves(u) {
            let (x, y) = m;
            let v = if self.get_alias(y) == self.get_alias(u) {
                self.get_alias(x)
            } else {
                self.get_alias(y)
            };
            self.active_moves.remove(&m);
            if let Some(pos) = self.worklist_moves.iter().position(|&w| w == m) {
                self.worklist_moves.remove(pos);
            }
            self.frozen_moves.insert(m);
            if !self.precolored.contains(&v)
                && self.node_moves(v).is_empty()
                && self.degree_of(v) < self.k
            {
                remove_item(&mut self.freeze_worklist, v);
                push_unique(&mut self.simplify_worklist, v);
            }
        }
    }

    /// Prefers a candidate that did not come out of a previous rewrite,
    /// so spilling makes progress; falls back to the worklist head.
    fn select_spill(&mut self) {
        let pick = self
            .spill_worklist
            .iter()
            .copied()
            .find(|t| {
                !self.not_spill.contains(t)
                    && !self.spilled.contains(t)
                    && !self.precolored.contains(t)
            })
            .unwrap_or(self.spill_worklist[0]);
        remove_item(&mut self.spill_worklist, pick);
        push_unique(&mut self.simplify_worklist, pick);
        self.freeze_moves(pick);
    }

    fn assign_colors(&mut self) {
        while let Some(n) = self.select_stack.pop() {
            let mut ok_colors: Vec<Temp> = x64::REGISTERS.to_vec();
            let neighbors: Vec<Temp> = self
                .adj_list
                .get(&n)
                .map(|s| s.iter().copied().collect())
                .unwrap_or_default();
            for w in neighbors {
                let a = self.get_alias(w);
                if self.colored.contains(&a) || self.precolored.contains(&a) {
                    if let Some(c) = self.color.get(&a) {
                        ok_colors.retain(|col| col != c);
                    }
                }
            }
            match ok_colors.first() {
                None => self.spilled.push(n),
                Some(&c) => {
                    self.colored.insert(n);
                    self.color.insert(n, c);
                }
            }
        }
        let coalesced: Vec<Temp> = self.coalesced.iter().copied().collect();
        for n in coalesced {
            let a = self.get_alias(n);
            if let Some(&c) = self.color.get(&a) {
                self.color.insert(n, c);
            }
        }
    }
}
