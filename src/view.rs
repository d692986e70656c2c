use serde::Serialize;

/// Follow-up the client can offer from an empty view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewAction {
    pub label: &'static str,
    pub route: &'static str,
}

/// Stable render state attached to list and dashboard results.
///
/// Loading is whatever the client shows while a request is in flight and
/// errors travel in the `ok:false` envelope, so only the two settled states
/// are produced here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum ViewState {
    Empty {
        message: &'static str,
        #[serde(skip_serializing_if = "Option::is_none")]
        action: Option<ViewAction>,
    },
    Populated {
        count: usize,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct EmptyCopy {
    pub message: &'static str,
    pub action: Option<(&'static str, &'static str)>,
}

impl EmptyCopy {
    pub const fn new(message: &'static str) -> Self {
        Self {
            message,
            action: None,
        }
    }

    pub const fn with_action(message: &'static str, label: &'static str, route: &'static str) -> Self {
        Self {
            message,
            action: Some((label, route)),
        }
    }
}

pub fn view_of(count: usize, empty: EmptyCopy) -> ViewState {
    if count == 0 {
        ViewState::Empty {
            message: empty.message,
            action: empty
                .action
                .map(|(label, route)| ViewAction { label, route }),
        }
    } else {
        ViewState::Populated { count }
    }
}

pub fn view_json(count: usize, empty: EmptyCopy) -> serde_json::Value {
    serde_json::to_value(view_of(count, empty)).unwrap_or(serde_json::Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_state_carries_message_and_action() {
        let copy = EmptyCopy::with_action("No groups yet", "Create group", "/admin/groups/new");
        assert_eq!(
            view_json(0, copy),
            json!({
                "state": "empty",
                "message": "No groups yet",
                "action": { "label": "Create group", "route": "/admin/groups/new" }
            })
        );
    }

    #[test]
    fn populated_state_reports_count() {
        let copy = EmptyCopy::new("Nothing here");
        assert_eq!(view_json(3, copy), json!({ "state": "populated", "count": 3 }));
        assert_eq!(
            view_json(0, copy),
            json!({ "state": "empty", "message": "Nothing here" })
        );
    }
}
