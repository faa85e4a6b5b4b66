//! Tracker transition selection.

/// Default completion transitions, highest priority first.
pub const DONE_PRIORITY: [&str; 4] = ["Resolved", "Done", "Closed", "Complete"];

/// A named transition offered by the tracker for one ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionOption {
    pub id: String,
    pub name: String,
}

/// Transitions a tracker offers for one ticket, in the tracker's order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitionList(Vec<TransitionOption>);

impl TransitionList {
    pub fn as_slice(&self) -> &[TransitionOption] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.0.iter().map(|option| option.name.as_str()).collect()
    }

    /// See [`choose_transition`].
    pub fn choose<S: AsRef<str>>(&self, priority: &[S]) -> Option<&TransitionOption> {
        choose_transition(&self.0, priority)
    }
}

impl From<Vec<TransitionOption>> for TransitionList {
    fn from(options: Vec<TransitionOption>) -> Self {
        Self(options)
    }
}

impl FromIterator<TransitionOption> for TransitionList {
    fn from_iter<I: IntoIterator<Item = TransitionOption>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Choose the first transition whose name matches the priority list.
///
/// Priority order wins over the order the tracker lists transitions in.
/// Names compare case-insensitively after trimming. Returns `None` when
/// nothing matches; callers must not invent a transition.
pub fn choose_transition<'a, S: AsRef<str>>(
    available: &'a [TransitionOption],
    priority: &[S],
) -> Option<&'a TransitionOption> {
    priority.iter().find_map(|wanted| {
        let wanted = wanted.as_ref().trim();
        available
            .iter()
            .find(|option| option.name.trim().eq_ignore_ascii_case(wanted))
    })
}
