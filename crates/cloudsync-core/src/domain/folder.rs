//! Folder selection state

use std::fmt;

use serde::{Deserialize, Serialize};

/// Tri-state selection of a folder in the selective-sync tree
///
/// `Partial` only applies to folders with children: some but not all of
/// them are selected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionState {
    #[default]
    Selected,
    Deselected,
    Partial,
}

impl SelectionState {
    pub fn from_bool(selected: bool) -> Self {
        if selected {
            SelectionState::Selected
        } else {
            SelectionState::Deselected
        }
    }

    /// Aggregates child states: all selected, all deselected, or partial
    ///
    /// Returns `None` for an empty iterator.
    pub fn aggregate(states: impl IntoIterator<Item = SelectionState>) -> Option<Self> {
        let mut result: Option<SelectionState> = None;
        for state in states {
            result = match (result, state) {
                (None, s) => Some(s),
                (Some(SelectionState::Partial), _) | (_, SelectionState::Partial) => {
                    return Some(SelectionState::Partial)
                }
                (Some(a), b) if a == b => Some(a),
                _ => return Some(SelectionState::Partial),
            };
        }
        result
    }
}

impl fmt::Display for SelectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectionState::Selected => write!(f, "selected"),
            SelectionState::Deselected => write!(f, "deselected"),
            SelectionState::Partial => write!(f, "partial"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SelectionState::*;

    #[test]
    fn test_aggregate() {
        assert_eq!(SelectionState::aggregate([Selected, Selected]), Some(Selected));
        assert_eq!(
            SelectionState::aggregate([Deselected, Deselected]),
            Some(Deselected)
        );
        assert_eq!(SelectionState::aggregate([Selected, Deselected]), Some(Partial));
        assert_eq!(SelectionState::aggregate([Selected, Partial]), Some(Partial));
        assert_eq!(SelectionState::aggregate([]), None);
    }
}
