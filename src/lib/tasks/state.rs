use std::collections::HashMap;
use std::sync::LazyLock;

use super::types::{State, TaskType};

static STATE_TRANSITIONS: LazyLock<HashMap<State, Vec<State>>> = LazyLock::new(|| {
    let mut map = HashMap::new();
    map.insert(State::Pending, vec![State::Processing]);
    map.insert(
        State::Processing,
        vec![State::Completed, State::Failed, State::Running],
    );
    map.insert(State::Running, vec![State::Stopped, State::Failed]);
    map.insert(State::Completed, vec![]);
    map.insert(State::Stopped, vec![]);
    map.insert(State::Failed, vec![]);
    map
});

/// Whether a task of `task_type` may move from `src` to `dst`.
///
/// Only deployments enter `running`; everything else ends in `completed` or `failed`.
pub fn valid_state_transition(task_type: TaskType, src: &State, dst: &State) -> bool {
    if *dst == State::Running && !task_type.is_deployment() {
        return false;
    }
    if *dst == State::Completed && task_type.is_deployment() {
        return false;
    }

    STATE_TRANSITIONS
        .get(src)
        .is_some_and(|valid_states| valid_states.contains(dst))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversion_lifecycle() {
        let t = TaskType::ImageConvert;
        assert!(valid_state_transition(t, &State::Pending, &State::Processing));
        assert!(valid_state_transition(t, &State::Processing, &State::Completed));
        assert!(valid_state_transition(t, &State::Processing, &State::Failed));
        assert!(!valid_state_transition(t, &State::Processing, &State::Running));
        assert!(!valid_state_transition(t, &State::Pending, &State::Completed));
    }

    #[test]
    fn deployment_lifecycle() {
        let t = TaskType::GithubDeploy;
        assert!(valid_state_transition(t, &State::Processing, &State::Running));
        assert!(valid_state_transition(t, &State::Running, &State::Stopped));
        assert!(valid_state_transition(t, &State::Running, &State::Failed));
        assert!(!valid_state_transition(t, &State::Processing, &State::Completed));
        assert!(!valid_state_transition(t, &State::Pending, &State::Running));
    }

    #[test]
    fn terminal_states_never_move() {
        for t in TaskType::ALL {
            for terminal in [State::Completed, State::Stopped, State::Failed] {
                for dst in [
                    State::Pending,
                    State::Processing,
                    State::Running,
                    State::Completed,
                    State::Stopped,
                    State::Failed,
                ] {
                    assert!(!valid_state_transition(t, &terminal, &dst));
                }
            }
        }
    }
}
