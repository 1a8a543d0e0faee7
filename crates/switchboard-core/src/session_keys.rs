//! Session key grammar.
//!
//! Child sessions live under `agent:<agentId>:subagent:<uuid>`; generic
//! agent sessions are `agent:<agentId>:<rest>`. The aliases `main` and
//! the configured main key both resolve to the configured main key;
//! `global` and `unknown` pass through unchanged, as do bare keys.

/// Pseudo-key for messages with no owning conversation.
pub const GLOBAL_KEY: &str = "global";

/// Pseudo-key for messages whose origin could not be resolved.
pub const UNKNOWN_KEY: &str = "unknown";

/// Alias always resolving to the configured main session key.
pub const MAIN_ALIAS: &str = "main";

const AGENT_PREFIX: &str = "agent:";
const SUBAGENT_MARKER: &str = ":subagent:";

/// Build the session key for a spawned child run.
#[must_use]
pub fn subagent_session_key(agent_id: &str, run_suffix: &str) -> String {
    format!("{AGENT_PREFIX}{agent_id}{SUBAGENT_MARKER}{run_suffix}")
}

/// Whether a key names a spawned child session.
#[must_use]
pub fn is_subagent_key(key: &str) -> bool {
    key.starts_with(AGENT_PREFIX) && key.contains(SUBAGENT_MARKER)
}

/// Extract the agent id from an `agent:<id>:<rest>` key.
#[must_use]
pub fn agent_id_of(key: &str) -> Option<&str> {
    let rest = key.strip_prefix(AGENT_PREFIX)?;
    let (agent_id, _) = rest.split_once(':')?;
    if agent_id.is_empty() {
        None
    } else {
        Some(agent_id)
    }
}

/// Resolve a raw key to its canonical form.
///
/// `main` (and the configured main key itself) map to `main_key`;
/// `global` / `unknown` and everything else pass through trimmed.
#[must_use]
pub fn canonical_session_key(raw: &str, main_key: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == MAIN_ALIAS || trimmed == main_key {
        return main_key.to_owned();
    }
    trimmed.to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subagent_keys_follow_the_grammar() {
        let key = subagent_session_key("helper", "0192-aaaa");
        assert_eq!(key, "agent:helper:subagent:0192-aaaa");
        assert!(is_subagent_key(&key));
        assert_eq!(agent_id_of(&key), Some("helper"));
    }

    #[test]
    fn generic_agent_keys_are_not_subagent_keys() {
        assert!(!is_subagent_key("agent:helper:slack-dm"));
        assert_eq!(agent_id_of("agent:helper:slack-dm"), Some("helper"));
        assert_eq!(agent_id_of("helper"), None);
        assert_eq!(agent_id_of("agent::oops"), None);
    }

    #[test]
    fn canonicalization_resolves_aliases() {
        let main = "agent:primary:main";
        assert_eq!(canonical_session_key("main", main), main);
        assert_eq!(canonical_session_key(main, main), main);
        assert_eq!(canonical_session_key("  main  ", main), main);
        assert_eq!(canonical_session_key("", main), main);
        assert_eq!(canonical_session_key("global", main), GLOBAL_KEY);
        assert_eq!(canonical_session_key("unknown", main), UNKNOWN_KEY);
        assert_eq!(
            canonical_session_key("agent:helper:subagent:x", main),
            "agent:helper:subagent:x"
        );
    }
}
