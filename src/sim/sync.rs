//! Synchronizing simulators running in parallel.
//!
//! A [`GlobalClock`] runs several [`Simulator`]s (nodes), each on its own thread,
//! and keeps their simulated time within one period of each other.
//!
//! Every node gets a local timer which fires once per period of that node's own clock.
//! When it fires, the node reports its arrival to the global clock and blocks.
//! Once every node still running has arrived, the global clock ticks and releases them all.
//! A node which stops (or reaches its cycle limit) leaves the group, so the others never wait on it.
//!
//! Nodes share no memory. All coordination goes through channels.
//!
//! ```
//! use avr_sim::isa::Instr;
//! use avr_sim::program::Program;
//! use avr_sim::sim::sync::GlobalClock;
//! use avr_sim::sim::Simulator;
//!
//! let program = Program::from_instrs(&[Instr::RJMP { k: -1 }]);
//! let mut clock = GlobalClock::new(0.001);
//! for _ in 0..3 {
//!     let mut sim = Simulator::default();
//!     sim.load_program(&program).unwrap();
//!     clock.add_node(sim);
//! }
//!
//! let outcome = clock.run(1000);
//! assert_eq!(outcome.nodes.len(), 3);
//! // 0.001 ms is 16 cycles at 16 MHz
//! assert_eq!(outcome.ticks, 1000 / 16);
//! ```

use std::sync::Arc;

use crossbeam_channel as cbc;

use super::clock::Event;
use super::{SimErr, Simulator};

/// What a node tells the global clock.
enum Report {
    /// The node's local timer fired.
    Arrived(usize),
    /// The node is no longer running.
    Finished(usize),
}

/// The event a node's simulator fires once per period.
struct LocalTimer {
    id: usize,
    report: cbc::Sender<Report>,
    release: cbc::Receiver<()>,
}
impl Event for LocalTimer {
    fn fire(&self, _sim: &mut Simulator) {
        // if the global clock is gone, there is nothing left to wait for
        if self.report.send(Report::Arrived(self.id)).is_ok() {
            let _ = self.release.recv();
        }
    }
}

struct Node {
    sim: Simulator,
    release: cbc::Sender<()>,
}

/// The result of one node after [`GlobalClock::run`].
#[derive(Debug)]
pub struct NodeOutcome {
    /// The node's simulator, in the state it stopped in.
    pub sim: Simulator,
    /// The result of running the node.
    pub result: Result<(), SimErr>,
}

/// The result of [`GlobalClock::run`].
#[derive(Debug)]
pub struct SyncOutcome {
    /// The number of global ticks that elapsed.
    pub ticks: u64,
    /// The nodes, in the order they were added.
    pub nodes: Vec<NodeOutcome>,
}

/// Keeps a group of simulators in lockstep, one period at a time.
pub struct GlobalClock {
    period_ms: f64,
    nodes: Vec<Node>,
    report_tx: cbc::Sender<Report>,
    report_rx: cbc::Receiver<Report>,
}
impl GlobalClock {
    /// Creates a global clock which synchronizes nodes every `period_ms` milliseconds of simulated time.
    pub fn new(period_ms: f64) -> Self {
        let (report_tx, report_rx) = cbc::unbounded();
        Self { period_ms, nodes: vec![], report_tx, report_rx }
    }

    /// The synchronization period in milliseconds.
    pub fn period_ms(&self) -> f64 {
        self.period_ms
    }

    /// The number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether there are no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Adds a node, installing its local timer. This returns the node's index.
    ///
    /// The period is converted to cycles with the node's own clock frequency.
    pub fn add_node(&mut self, mut sim: Simulator) -> usize {
        let id = self.nodes.len();
        let (release_tx, release_rx) = cbc::bounded(1);
        let timer = LocalTimer { id, report: self.report_tx.clone(), release: release_rx };

        let period = sim.props().millis_to_cycles(self.period_ms).max(1);
        sim.insert_periodic_event(Arc::new(timer), period);
        log::debug!("node {id} synchronizes every {period} cycles");

        self.nodes.push(Node { sim, release: release_tx });
        id
    }

    /// Runs every node on its own thread until it stops or its clock reaches `max_cycles`.
    ///
    /// This blocks until every node has finished.
    /// If a node's thread panics, the panic is propagated.
    pub fn run(self, max_cycles: u64) -> SyncOutcome {
        let Self { nodes, report_tx, report_rx, .. } = self;

        let mut releases = Vec::with_capacity(nodes.len());
        let mut handles = Vec::with_capacity(nodes.len());
        for (id, Node { mut sim, release }) in nodes.into_iter().enumerate() {
            releases.push(release);

            let report = report_tx.clone();
            handles.push(std::thread::spawn(move || {
                let result = sim.run_for_cycles(max_cycles);
                let _ = report.send(Report::Finished(id));
                NodeOutcome { sim, result }
            }));
        }
        // only the nodes hold senders now, so the channel closes once they all finish
        drop(report_tx);

        let ticks = coordinate(&report_rx, &releases);

        let nodes = handles.into_iter()
            .map(|h| h.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
            .collect();
        SyncOutcome { ticks, nodes }
    }
}
impl std::fmt::Debug for GlobalClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalClock")
            .field("period_ms", &self.period_ms)
            .field("nodes", &self.nodes.len())
            .finish_non_exhaustive()
    }
}

/// Collects arrivals, releasing every waiting node once all live nodes have arrived.
///
/// This returns the number of ticks.
fn coordinate(reports: &cbc::Receiver<Report>, releases: &[cbc::Sender<()>]) -> u64 {
    let mut live = vec![true; releases.len()];
    let mut waiting = vec![];
    let mut ticks = 0;

    while live.iter().any(|&l| l) {
        let Ok(report) = reports.recv() else { break };
        match report {
            Report::Arrived(id) => waiting.push(id),
            Report::Finished(id) => {
                log::debug!("node {id} left after {ticks} ticks");
                live[id] = false;
            },
        }

        let live_count = live.iter().filter(|&&l| l).count();
        if !waiting.is_empty() && waiting.len() >= live_count {
            ticks += 1;
            log::trace!("global tick {ticks}");
            for id in waiting.drain(..) {
                let _ = releases[id].send(());
            }
        }
    }
    ticks
}

#[cfg(test)]
mod tests {
    use crate::isa::Instr;
    use crate::program::Program;
    use crate::sim::Simulator;

    use super::GlobalClock;

    fn node(instrs: &[Instr]) -> Simulator {
        let mut sim = Simulator::default();
        sim.load_program(&Program::from_instrs(instrs)).unwrap();
        sim
    }

    #[test]
    fn test_lockstep() {
        let mut clock = GlobalClock::new(0.001);
        for _ in 0..4 {
            clock.add_node(node(&[Instr::RJMP { k: -1 }]));
        }
        assert_eq!(clock.len(), 4);

        let outcome = clock.run(1000);
        assert_eq!(outcome.ticks, 62);
        for n in &outcome.nodes {
            assert!(n.result.is_ok());
            assert_eq!(n.sim.cycles(), 1000);
        }
    }

    #[test]
    fn test_finished_node_leaves() {
        let mut clock = GlobalClock::new(0.001);
        clock.add_node(node(&[Instr::BREAK]));
        clock.add_node(node(&[Instr::RJMP { k: -1 }]));
        // stops partway through
        clock.add_node(node(&[
            Instr::LDI { rd: crate::isa::reg_consts::R16, k: 20 },
            Instr::DEC { rd: crate::isa::reg_consts::R16 },
            Instr::BRBC { s: 1, k: -2 },
            Instr::BREAK,
        ]));

        let outcome = clock.run(1000);
        assert_eq!(outcome.ticks, 62);
        assert!(outcome.nodes[0].sim.hit_break_instr());
        assert_eq!(outcome.nodes[1].sim.cycles(), 1000);
        assert!(outcome.nodes[2].sim.hit_break_instr());
    }

    #[test]
    fn test_errors_are_per_node() {
        let mut clock = GlobalClock::new(0.001);
        clock.add_node(Simulator::default());
        clock.add_node(node(&[Instr::RJMP { k: -1 }]));

        let outcome = clock.run(100);
        assert!(outcome.nodes[0].result.is_err());
        assert!(outcome.nodes[1].result.is_ok());
        assert_eq!(outcome.ticks, 100 / 16);
    }
}
