//! Finite state machines for device modeling.
//!
//! Devices such as radios and flash controllers move between power or operating states,
//! and some of those moves take time. A [`FiniteStateMachine`] tracks the current state,
//! checks each requested transition against a [`TransitionTimeMatrix`],
//! and schedules timed transitions on the simulator's main clock.
//!
//! ```
//! use avr_sim::sim::fsm::{FiniteStateMachine, TransitionTimeMatrix, IN_TRANSITION};
//! use avr_sim::sim::Simulator;
//!
//! let mut sim = Simulator::default();
//! let radio = FiniteStateMachine::new(
//!     "radio",
//!     ["off", "idle", "rx"],
//!     0,
//!     TransitionTimeMatrix::ring(3, 100, true),
//! );
//!
//! radio.transition(&mut sim, 1).unwrap();
//! assert_eq!(radio.current_state(), IN_TRANSITION);
//! assert_eq!(radio.state_name(radio.current_state()), "<in transition>");
//!
//! sim.advance_cycles(100);
//! assert_eq!(radio.current_state(), 1);
//! assert_eq!(radio.state_name(1), "idle");
//!
//! // idle -> off is not an edge of the ring
//! assert!(radio.transition(&mut sim, 0).is_err());
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use super::clock::Event;
use super::probe::{remove_ref, same_ref};
use super::{SimErr, Simulator};

/// The current state of a machine while a timed transition is pending.
pub const IN_TRANSITION: i32 = -1;

/// Callbacks fired around state transitions.
#[allow(unused_variables)]
pub trait FsmProbe: Send + Sync {
    /// Called before the state changes.
    fn fire_before_transition(&self, sim: &mut Simulator, from: i32, to: i32) {}
    /// Called after the state changes.
    fn fire_after_transition(&self, sim: &mut Simulator, from: i32, to: i32) {}
}
/// A shared [`FsmProbe`] handle.
pub type FsmProbeRef = Arc<dyn FsmProbe>;

/// The time in cycles each transition takes.
///
/// Entry `(from, to)` is `None` if the machine cannot move from `from` to `to` directly.
/// The diagonal is always `Some(0)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionTimeMatrix {
    n: usize,
    times: Vec<Option<u64>>,
}
impl TransitionTimeMatrix {
    fn with(n: usize, mut time: impl FnMut(usize, usize) -> Option<u64>) -> Self {
        let times = (0..n)
            .flat_map(|from| (0..n).map(move |to| (from, to)))
            .map(|(from, to)| match from == to {
                true  => Some(0),
                false => time(from, to),
            })
            .collect();

        Self { n, times }
    }

    /// Creates a matrix from rows of times, where `-1` marks an illegal transition.
    ///
    /// This returns `None` if the rows are not square, if the diagonal is not 0,
    /// or if any entry is below `-1`.
    pub fn from_rows(rows: &[Vec<i64>]) -> Option<Self> {
        let n = rows.len();
        if rows.iter().any(|r| r.len() != n) {
            return None;
        }

        let mut times = Vec::with_capacity(n * n);
        for (from, row) in rows.iter().enumerate() {
            for (to, &t) in row.iter().enumerate() {
                let entry = match t {
                    -1 => None,
                    t => Some(u64::try_from(t).ok()?),
                };
                if from == to && entry != Some(0) {
                    return None;
                }
                times.push(entry);
            }
        }
        Some(Self { n, times })
    }

    /// Every state can move to every other state in `time` cycles.
    pub fn uniform(n: usize, time: u64) -> Self {
        Self::with(n, |_, _| Some(time))
    }

    /// Every state can move to `default_state` in `to_time` cycles,
    /// and `default_state` can move to every state in `from_time` cycles.
    ///
    /// No other transitions are legal.
    pub fn bimodal(n: usize, default_state: usize, to_time: u64, from_time: u64) -> Self {
        Self::with(n, |from, to| {
            if to == default_state {
                Some(to_time)
            } else if from == default_state {
                Some(from_time)
            } else {
                None
            }
        })
    }

    /// Each state `i` can move to state `i + 1` in `time` cycles.
    ///
    /// If `wrap` is set, the last state can also move to state 0.
    pub fn ring(n: usize, time: u64, wrap: bool) -> Self {
        Self::with(n, |from, to| {
            let forward = to == from + 1 || (wrap && from + 1 == n && to == 0);
            forward.then_some(time)
        })
    }

    /// The number of states in this matrix.
    pub fn len(&self) -> usize {
        self.n
    }

    /// Whether this matrix has no states.
    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    /// The time of the transition, if it is legal.
    pub fn time(&self, from: usize, to: usize) -> Option<u64> {
        if from >= self.n || to >= self.n { return None; }
        self.times[from * self.n + to]
    }
}

struct Machine {
    name: String,
    state_names: Vec<String>,
    transition_time: TransitionTimeMatrix,
    start_state: i32,
    cur_state: i32,
    probes: Vec<FsmProbeRef>,
    state_probes: Vec<Vec<FsmProbeRef>>,
}
impl Machine {
    fn num_states(&self) -> i32 {
        self.state_names.len() as i32
    }

    fn illegal(&self, to: i32) -> SimErr {
        SimErr::IllegalTransition { machine: self.name.clone(), from: self.cur_state, to }
    }

    /// The probes of a transition, in firing order: global, source state, destination state.
    fn probes_for(&self, from: i32, to: i32) -> Vec<FsmProbeRef> {
        let state = |s: i32| usize::try_from(s).ok()
            .and_then(|s| self.state_probes.get(s))
            .into_iter()
            .flatten();

        self.probes.iter()
            .chain(state(from))
            .chain(state(to))
            .cloned()
            .collect()
    }
}

/// A finite state machine whose transitions may take time.
///
/// This is a shared handle. Clones refer to the same machine,
/// which is how a scheduled transition finishes after the call that started it.
#[derive(Clone)]
pub struct FiniteStateMachine {
    inner: Arc<Mutex<Machine>>,
}
impl FiniteStateMachine {
    /// Creates a new machine in `start_state`.
    ///
    /// The state names double as the state count. If the matrix has a different number of states,
    /// transitions outside of the matrix are illegal.
    pub fn new<S: Into<String>>(
        name: impl Into<String>,
        state_names: impl IntoIterator<Item=S>,
        start_state: i32,
        transition_time: TransitionTimeMatrix,
    ) -> Self {
        let state_names: Vec<String> = state_names.into_iter().map(Into::into).collect();
        let state_probes = vec![vec![]; state_names.len()];

        Self {
            inner: Arc::new(Mutex::new(Machine {
                name: name.into(),
                state_names,
                transition_time,
                start_state,
                cur_state: start_state,
                probes: vec![],
                state_probes,
            }))
        }
    }

    fn lock(&self) -> MutexGuard<'_, Machine> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The name of this machine.
    pub fn name(&self) -> String {
        self.lock().name.clone()
    }
    /// The current state, or [`IN_TRANSITION`] if a timed transition is pending.
    pub fn current_state(&self) -> i32 {
        self.lock().cur_state
    }
    /// The state this machine started in.
    pub fn start_state(&self) -> i32 {
        self.lock().start_state
    }
    /// The number of states.
    pub fn num_states(&self) -> i32 {
        self.lock().num_states()
    }
    /// The name of a state.
    pub fn state_name(&self, state: i32) -> String {
        if state == IN_TRANSITION {
            return String::from("<in transition>");
        }
        let m = self.lock();
        usize::try_from(state).ok()
            .and_then(|s| m.state_names.get(s))
            .cloned()
            .unwrap_or_else(|| format!("<invalid state {state}>"))
    }
    /// The time in cycles from one state to another, if the transition is legal.
    pub fn transition_time(&self, from: i32, to: i32) -> Option<u64> {
        let from = usize::try_from(from).ok()?;
        let to = usize::try_from(to).ok()?;
        self.lock().transition_time.time(from, to)
    }

    /// Adds a probe fired on every transition.
    pub fn insert_probe(&self, probe: FsmProbeRef) {
        self.lock().probes.push(probe);
    }
    /// Removes a probe fired on every transition, comparing by reference identity.
    pub fn remove_probe(&self, probe: &FsmProbeRef) -> bool {
        remove_ref(&mut self.lock().probes, probe)
    }
    /// Adds a probe fired on transitions into or out of a state.
    ///
    /// This returns false if the state does not exist.
    pub fn insert_state_probe(&self, state: i32, probe: FsmProbeRef) -> bool {
        let mut m = self.lock();
        match usize::try_from(state).ok().and_then(|s| m.state_probes.get_mut(s)) {
            Some(list) => {
                list.push(probe);
                true
            },
            None => false,
        }
    }
    /// Removes a probe from a state, comparing by reference identity.
    pub fn remove_state_probe(&self, state: i32, probe: &FsmProbeRef) -> bool {
        let mut m = self.lock();
        usize::try_from(state).ok()
            .and_then(|s| m.state_probes.get_mut(s))
            .is_some_and(|list| remove_ref(list, probe))
    }

    /// Moves to `new_state`.
    ///
    /// A transition taking 0 cycles happens immediately.
    /// Otherwise, the machine is [`IN_TRANSITION`] until the transition time has elapsed on the main clock.
    ///
    /// Before-transition probes fire now, and after-transition probes fire once the new state is set.
    ///
    /// # Errors
    ///
    /// - [`SimErr::IllegalTransition`] if the state does not exist or the matrix has no such edge.
    /// - [`SimErr::TransitionInProgress`] if a timed transition is pending.
    pub fn transition(&self, sim: &mut Simulator, new_state: i32) -> Result<(), SimErr> {
        let (from, time, probes) = {
            let mut m = self.lock();
            if !(0..m.num_states()).contains(&new_state) {
                return Err(m.illegal(new_state));
            }
            if m.cur_state == IN_TRANSITION {
                return Err(SimErr::TransitionInProgress { machine: m.name.clone(), to: new_state });
            }
            let from = m.cur_state;
            let time = usize::try_from(from).ok()
                .and_then(|f| m.transition_time.time(f, new_state as usize))
                .ok_or_else(|| m.illegal(new_state))?;

            log::trace!("{}: {} -> {} in {time} cycles", m.name, from, new_state);
            if time > 0 {
                m.cur_state = IN_TRANSITION;
            }
            (from, time, m.probes_for(from, new_state))
        };

        for p in &probes {
            p.fire_before_transition(sim, from, new_state);
        }

        match time {
            0 => {
                self.lock().cur_state = new_state;
                for p in &probes {
                    p.fire_after_transition(sim, from, new_state);
                }
            },
            t => {
                let event = TransitionEvent { machine: Arc::downgrade(&self.inner), from, to: new_state };
                sim.clock.insert_event(Arc::new(event), t);
            }
        }
        Ok(())
    }
}
impl std::fmt::Debug for FiniteStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let m = self.lock();
        f.debug_struct("FiniteStateMachine")
            .field("name", &m.name)
            .field("states", &m.state_names)
            .field("cur_state", &m.cur_state)
            .field("probes", &m.probes.len())
            .finish_non_exhaustive()
    }
}
impl PartialEq for FiniteStateMachine {
    fn eq(&self, other: &Self) -> bool {
        same_ref(&self.inner, &other.inner)
    }
}

/// Finishes a timed transition.
struct TransitionEvent {
    machine: Weak<Mutex<Machine>>,
    from: i32,
    to: i32,
}
impl Event for TransitionEvent {
    fn fire(&self, sim: &mut Simulator) {
        let Some(machine) = self.machine.upgrade() else { return };
        let probes = {
            let mut m = machine.lock().unwrap_or_else(PoisonError::into_inner);
            m.cur_state = self.to;
            m.probes_for(self.from, self.to)
        };
        for p in &probes {
            p.fire_after_transition(sim, self.from, self.to);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use crate::sim::{SimErr, Simulator};

    use super::{FiniteStateMachine, FsmProbe, FsmProbeRef, TransitionTimeMatrix, IN_TRANSITION};

    struct Log(&'static str, Arc<Mutex<Vec<String>>>);
    impl FsmProbe for Log {
        fn fire_before_transition(&self, sim: &mut Simulator, from: i32, to: i32) {
            self.1.lock().unwrap().push(format!("{} before {from}->{to} @{}", self.0, sim.cycles()));
        }
        fn fire_after_transition(&self, sim: &mut Simulator, from: i32, to: i32) {
            self.1.lock().unwrap().push(format!("{} after {from}->{to} @{}", self.0, sim.cycles()));
        }
    }

    #[test]
    fn test_matrix_builders() {
        let m = TransitionTimeMatrix::uniform(3, 7);
        assert_eq!(m.time(0, 2), Some(7));
        assert_eq!(m.time(1, 1), Some(0));
        assert_eq!(m.time(3, 0), None);

        let m = TransitionTimeMatrix::bimodal(4, 0, 10, 20);
        assert_eq!(m.time(2, 0), Some(10));
        assert_eq!(m.time(0, 3), Some(20));
        assert_eq!(m.time(1, 2), None);

        let m = TransitionTimeMatrix::ring(3, 5, false);
        assert_eq!(m.time(0, 1), Some(5));
        assert_eq!(m.time(1, 2), Some(5));
        assert_eq!(m.time(2, 0), None);
        assert_eq!(m.time(1, 0), None);
        assert_eq!(TransitionTimeMatrix::ring(3, 5, true).time(2, 0), Some(5));

        let rows = vec![vec![0, 3], vec![-1, 0]];
        let m = TransitionTimeMatrix::from_rows(&rows).unwrap();
        assert_eq!(m.time(0, 1), Some(3));
        assert_eq!(m.time(1, 0), None);
        assert!(TransitionTimeMatrix::from_rows(&[vec![0, -2], vec![0, 0]]).is_none());
        assert!(TransitionTimeMatrix::from_rows(&[vec![1, 0], vec![0, 0]]).is_none());
        assert!(TransitionTimeMatrix::from_rows(&[vec![0, 0]]).is_none());
    }

    #[test]
    fn test_instant_transition_order() {
        let mut sim = Simulator::default();
        let log = Arc::new(Mutex::new(vec![]));
        let fsm = FiniteStateMachine::new("m", ["a", "b", "c"], 0, TransitionTimeMatrix::uniform(3, 0));
        fsm.insert_state_probe(1, Arc::new(Log("dst", log.clone())));
        fsm.insert_state_probe(0, Arc::new(Log("src", log.clone())));
        fsm.insert_state_probe(2, Arc::new(Log("other", log.clone())));
        fsm.insert_probe(Arc::new(Log("global", log.clone())));

        fsm.transition(&mut sim, 1).unwrap();
        assert_eq!(fsm.current_state(), 1);
        assert_eq!(*log.lock().unwrap(), [
            "global before 0->1 @0",
            "src before 0->1 @0",
            "dst before 0->1 @0",
            "global after 0->1 @0",
            "src after 0->1 @0",
            "dst after 0->1 @0",
        ]);
    }

    #[test]
    fn test_timed_transition() {
        let mut sim = Simulator::default();
        let log = Arc::new(Mutex::new(vec![]));
        let fsm = FiniteStateMachine::new("m", ["a", "b"], 0, TransitionTimeMatrix::uniform(2, 50));
        fsm.insert_probe(Arc::new(Log("p", log.clone())));

        sim.advance_cycles(10);
        fsm.transition(&mut sim, 1).unwrap();
        assert_eq!(fsm.current_state(), IN_TRANSITION);
        assert!(matches!(
            fsm.transition(&mut sim, 0),
            Err(SimErr::TransitionInProgress { to: 0, .. })
        ));

        sim.advance_cycles(49);
        assert_eq!(fsm.current_state(), IN_TRANSITION);
        sim.advance_cycles(1);
        assert_eq!(fsm.current_state(), 1);
        assert_eq!(*log.lock().unwrap(), ["p before 0->1 @10", "p after 0->1 @60"]);
    }

    #[test]
    fn test_transition_finishes_mid_advance() {
        let mut sim = Simulator::default();
        let log = Arc::new(Mutex::new(vec![]));
        let fsm = FiniteStateMachine::new("m", ["a", "b"], 0, TransitionTimeMatrix::uniform(2, 50));
        fsm.insert_probe(Arc::new(Log("p", log.clone())));

        sim.advance_cycles(10);
        fsm.transition(&mut sim, 1).unwrap();
        sim.advance_cycles(100);
        assert_eq!(fsm.current_state(), 1);
        assert_eq!(*log.lock().unwrap(), ["p before 0->1 @10", "p after 0->1 @60"]);
        assert_eq!(sim.cycles(), 110);
    }

    #[test]
    fn test_illegal_transitions() {
        let mut sim = Simulator::default();
        let fsm = FiniteStateMachine::new("m", ["a", "b", "c"], 0, TransitionTimeMatrix::ring(3, 0, false));
        assert!(matches!(
            fsm.transition(&mut sim, 2),
            Err(SimErr::IllegalTransition { from: 0, to: 2, .. })
        ));
        assert!(matches!(fsm.transition(&mut sim, 3), Err(SimErr::IllegalTransition { .. })));
        assert!(matches!(fsm.transition(&mut sim, -1), Err(SimErr::IllegalTransition { .. })));
        assert_eq!(fsm.current_state(), 0);

        // self-transitions are always legal
        fsm.transition(&mut sim, 0).unwrap();
        fsm.transition(&mut sim, 1).unwrap();
        assert_eq!(fsm.current_state(), 1);
    }

    #[test]
    fn test_queries_and_removal() {
        let mut sim = Simulator::default();
        let log = Arc::new(Mutex::new(vec![]));
        let fsm = FiniteStateMachine::new("m", ["a", "b"], 1, TransitionTimeMatrix::uniform(2, 0));
        assert_eq!(fsm.num_states(), 2);
        assert_eq!(fsm.start_state(), 1);
        assert_eq!(fsm.state_name(0), "a");
        assert_eq!(fsm.state_name(IN_TRANSITION), "<in transition>");
        assert_eq!(fsm.transition_time(0, 1), Some(0));

        let p: FsmProbeRef = Arc::new(Log("p", log.clone()));
        fsm.insert_probe(p.clone());
        assert!(fsm.insert_state_probe(0, p.clone()));
        assert!(!fsm.insert_state_probe(5, p.clone()));
        assert!(fsm.remove_probe(&p));
        assert!(fsm.remove_state_probe(0, &p));
        assert!(!fsm.remove_probe(&p));

        fsm.transition(&mut sim, 0).unwrap();
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(fsm.clone(), fsm);
    }
}
