//! Lifecycle hooks for scheduled operations.
//!
//! Every scheduled call gets one [`SchedulingContext`]. Listeners fire in
//! registration order against that same context, so a later listener can read
//! baggage an earlier one attached.
//!
//! ```text
//! on_schedule (at admission) -> on_start -> [on_exception] -> on_end
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use strand_types::Fault;

/// Operation arguments recorded in the context (`operation_name` and the like).
pub type ScheduleArgs = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleKind {
    /// Fire once after a delay.
    Timer(Duration),
    /// Fire every period until cancelled or the reactor stops.
    PeriodicTimer(Duration),
    /// Fire on the next reactor turn.
    NextTick,
}

impl ScheduleKind {
    /// Operation label, also used as the safety-wrapper context.
    pub const fn operation(self) -> &'static str {
        match self {
            Self::Timer(_) => "add_timer",
            Self::PeriodicTimer(_) => "add_periodic_timer",
            Self::NextTick => "next_tick",
        }
    }
}

/// Per-call record shared by all hooks of one scheduled operation.
///
/// `kind` and `args` are fixed at admission. `exception` is set by the
/// scheduler when the body fails. `baggage` is free for listeners.
#[derive(Debug, Clone)]
pub struct SchedulingContext {
    kind: ScheduleKind,
    args: ScheduleArgs,
    exception: Option<Fault>,
    baggage: BTreeMap<String, String>,
}

impl SchedulingContext {
    pub(crate) fn new(kind: ScheduleKind, args: ScheduleArgs) -> Self {
        Self {
            kind,
            args,
            exception: None,
            baggage: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> ScheduleKind {
        self.kind
    }

    #[must_use]
    pub fn args(&self) -> &ScheduleArgs {
        &self.args
    }

    #[must_use]
    pub fn arg(&self, key: &str) -> Option<&str> {
        self.args.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn exception(&self) -> Option<&Fault> {
        self.exception.as_ref()
    }

    pub(crate) fn set_exception(&mut self, fault: Fault) {
        self.exception = Some(fault);
    }

    #[must_use]
    pub fn baggage(&self, key: &str) -> Option<&str> {
        self.baggage.get(key).map(String::as_str)
    }

    pub fn set_baggage(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.baggage.insert(key.into(), value.into());
    }
}

pub type Hook = Rc<dyn Fn(&mut SchedulingContext)>;

pub type ExceptionHook = Rc<dyn Fn(&mut SchedulingContext, &Fault)>;

/// Ordered listeners for the four lifecycle events.
#[derive(Clone, Default)]
pub struct HookSet {
    on_schedule: Vec<Hook>,
    on_start: Vec<Hook>,
    on_exception: Vec<ExceptionHook>,
    on_end: Vec<Hook>,
}

impl fmt::Debug for HookSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookSet")
            .field("on_schedule", &self.on_schedule.len())
            .field("on_start", &self.on_start.len())
            .field("on_exception", &self.on_exception.len())
            .field("on_end", &self.on_end.len())
            .finish()
    }
}

impl HookSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_schedule(mut self, hook: impl Fn(&mut SchedulingContext) + 'static) -> Self {
        self.on_schedule.push(Rc::new(hook));
        self
    }

    pub fn on_start(mut self, hook: impl Fn(&mut SchedulingContext) + 'static) -> Self {
        self.on_start.push(Rc::new(hook));
        self
    }

    pub fn on_exception(mut self, hook: impl Fn(&mut SchedulingContext, &Fault) + 'static) -> Self {
        self.on_exception.push(Rc::new(hook));
        self
    }

    pub fn on_end(mut self, hook: impl Fn(&mut SchedulingContext) + 'static) -> Self {
        self.on_end.push(Rc::new(hook));
        self
    }

    /// Append every listener of `other` after this set's listeners.
    pub fn extend(mut self, other: HookSet) -> Self {
        self.on_schedule.extend(other.on_schedule);
        self.on_start.extend(other.on_start);
        self.on_exception.extend(other.on_exception);
        self.on_end.extend(other.on_end);
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.on_schedule.is_empty()
            && self.on_start.is_empty()
            && self.on_exception.is_empty()
            && self.on_end.is_empty()
    }

    pub(crate) fn fire_schedule(&self, context: &mut SchedulingContext) {
        fire(&self.on_schedule, context);
    }

    pub(crate) fn fire_start(&self, context: &mut SchedulingContext) {
        fire(&self.on_start, context);
    }

    pub(crate) fn fire_exception(&self, context: &mut SchedulingContext, fault: &Fault) {
        for hook in &self.on_exception {
            hook(context, fault);
        }
    }

    pub(crate) fn fire_end(&self, context: &mut SchedulingContext) {
        fire(&self.on_end, context);
    }
}

fn fire(hooks: &[Hook], context: &mut SchedulingContext) {
    for hook in hooks {
        hook(context);
    }
}
