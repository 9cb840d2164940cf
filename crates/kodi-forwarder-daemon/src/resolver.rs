//! Chord resolution
//!
//! The [`ChordResolver`] turns the raw key events coming off the controller
//! into discrete logical actions by combining each non-modifier event with
//! the set of currently-held modifier keys and looking the triple
//! (key, flags, phase) up in the mapping table.
//!
//! Modifier events only mutate the flag set and never resolve on their own.
//! A RELEASE event of a non-modifier always clears the flag set, matched or
//! not; remotes frequently drop the modifier bits from the release half of a
//! chord, and carrying stale flags past a completed chord would poison every
//! following lookup.

use std::sync::Arc;

use kodi_forwarder_config::{Action, EventPhase, MappingTable, ModifierFlags};

/// A logical action resolved from one raw key event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedAction {
    /// Forward a named button to the host (press or hold phase).
    ForwardKey { button: String, phase: EventPhase },
    /// The chord completed with a mapped release entry.
    ReleaseSequence { button: String },
    /// The chord completed, but the release event itself matched nothing;
    /// the previously forwarded press still has to be released.
    ReleaseOnly,
    /// A named power command.
    Special { command: String },
    /// A raw action payload for the host.
    Custom { payload: String },
}

pub struct ChordResolver {
    table: Arc<MappingTable>,
    flags: ModifierFlags,
    /// Raw key whose forwarded press is still awaiting its release.
    armed_key: Option<String>,
}

impl ChordResolver {
    pub fn new(table: Arc<MappingTable>) -> Self {
        Self {
            table,
            flags: ModifierFlags::NONE,
            armed_key: None,
        }
    }

    /// Currently-held modifier flags.
    pub fn flags(&self) -> ModifierFlags {
        self.flags
    }

    /// Forget all held state. Called whenever the input source is
    /// (re)acquired, so a half-finished chord from before the loss cannot
    /// leak into the new event stream.
    pub fn reset(&mut self) {
        self.flags.clear();
        self.armed_key = None;
    }

    /// Resolve one raw key event, updating the held-modifier state.
    pub fn resolve(&mut self, key: &str, phase: EventPhase) -> Option<ResolvedAction> {
        let contribution = ModifierFlags::for_key(key);
        if !contribution.is_empty() {
            match phase {
                EventPhase::Press | EventPhase::Hold => self.flags.insert(contribution),
                EventPhase::Release => self.flags.remove(contribution),
            }
            tracing::trace!("Modifier {} {} -> flags {}", key, phase, self.flags);
            return None;
        }

        let matched = self.lookup(key, phase).map(|entry| entry.action.clone());
        match matched {
            Some(Action::ForwardKey(button)) => match phase {
                EventPhase::Press => {
                    self.armed_key = Some(key.to_string());
                    Some(ResolvedAction::ForwardKey { button, phase })
                }
                // Hold repeats the forward but must not re-arm.
                EventPhase::Hold => Some(ResolvedAction::ForwardKey { button, phase }),
                EventPhase::Release => {
                    self.complete_chord();
                    Some(ResolvedAction::ReleaseSequence { button })
                }
            },
            Some(Action::SpecialCommand(command)) => {
                self.fire_on_release(phase, || ResolvedAction::Special { command })
            }
            Some(Action::CustomAction(payload)) => {
                self.fire_on_release(phase, || ResolvedAction::Custom { payload })
            }
            None => {
                if phase != EventPhase::Release {
                    return None;
                }

                // Command entries default to the press phase like everything
                // else, but commands fire on release; check that slot before
                // giving up on the event.
                let fallback = self
                    .table
                    .lookup(key, self.flags, EventPhase::Press)
                    .map(|entry| entry.action.clone());
                match fallback {
                    Some(Action::SpecialCommand(command)) => {
                        self.complete_chord();
                        return Some(ResolvedAction::Special { command });
                    }
                    Some(Action::CustomAction(payload)) => {
                        self.complete_chord();
                        return Some(ResolvedAction::Custom { payload });
                    }
                    Some(Action::ForwardKey(_)) | None => {}
                }

                self.flags.clear();
                if self.armed_key.take().is_some() {
                    Some(ResolvedAction::ReleaseOnly)
                } else {
                    None
                }
            }
        }
    }

    /// Phase-sensitive table lookup. Hold events repeat whatever the press
    /// entry does unless the mapping defines an explicit hold entry.
    fn lookup(&self, key: &str, phase: EventPhase) -> Option<&kodi_forwarder_config::MappingEntry> {
        let direct = self.table.lookup(key, self.flags, phase);
        if direct.is_none() && phase == EventPhase::Hold {
            return self.table.lookup(key, self.flags, EventPhase::Press);
        }
        direct
    }

    fn fire_on_release(
        &mut self,
        phase: EventPhase,
        action: impl FnOnce() -> ResolvedAction,
    ) -> Option<ResolvedAction> {
        match phase {
            EventPhase::Release => {
                self.complete_chord();
                Some(action())
            }
            // Commands fire once, on release; the press half is silent.
            EventPhase::Press | EventPhase::Hold => None,
        }
    }

    fn complete_chord(&mut self) {
        self.flags.clear();
        self.armed_key = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(json: &str) -> Arc<MappingTable> {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("t.json"), json).unwrap();
        Arc::new(kodi_forwarder_config::load_mapping(dir.path(), "t").unwrap())
    }

    fn simple_table() -> Arc<MappingTable> {
        table(
            r#"{
                "name": "t",
                "mapping": {
                    "KEY_A": [
                        { "key": "a", "flags": 2 }
                    ],
                    "KEY_UP": [
                        { "key": "up" },
                        { "key": "up", "phase": "release" }
                    ],
                    "KEY_POWER": [ { "command": "poweroff" } ],
                    "KEY_HOMEPAGE": [ { "action": "ActivateWindow(Home)", "phase": "release" } ]
                }
            }"#,
        )
    }

    #[test]
    fn modifier_state_follows_held_modifiers() {
        let mut resolver = ChordResolver::new(simple_table());

        assert_eq!(resolver.resolve("KEY_LEFTSHIFT", EventPhase::Press), None);
        assert_eq!(resolver.flags(), ModifierFlags::LEFT_SHIFT);

        assert_eq!(resolver.resolve("KEY_LEFTCTRL", EventPhase::Press), None);
        assert_eq!(
            resolver.flags(),
            ModifierFlags::LEFT_SHIFT | ModifierFlags::LEFT_CTRL
        );

        assert_eq!(resolver.resolve("KEY_LEFTCTRL", EventPhase::Release), None);
        assert_eq!(resolver.flags(), ModifierFlags::LEFT_SHIFT);

        assert_eq!(resolver.resolve("KEY_LEFTSHIFT", EventPhase::Release), None);
        assert_eq!(resolver.flags(), ModifierFlags::NONE);
    }

    #[test]
    fn chord_with_modifier_resolves_and_clears() {
        let mut resolver = ChordResolver::new(simple_table());

        resolver.resolve("KEY_LEFTSHIFT", EventPhase::Press);
        let action = resolver.resolve("KEY_A", EventPhase::Press);
        assert_eq!(
            action,
            Some(ResolvedAction::ForwardKey {
                button: "a".to_string(),
                phase: EventPhase::Press,
            })
        );

        // The remote drops the shift bit from the release half; the armed
        // press is still released and the flags end at zero.
        let action = resolver.resolve("KEY_A", EventPhase::Release);
        assert_eq!(action, Some(ResolvedAction::ReleaseOnly));
        assert_eq!(resolver.flags(), ModifierFlags::NONE);
    }

    #[test]
    fn press_release_pair_uses_the_release_entry() {
        let mut resolver = ChordResolver::new(simple_table());

        assert_eq!(
            resolver.resolve("KEY_UP", EventPhase::Press),
            Some(ResolvedAction::ForwardKey {
                button: "up".to_string(),
                phase: EventPhase::Press,
            })
        );
        assert_eq!(
            resolver.resolve("KEY_UP", EventPhase::Release),
            Some(ResolvedAction::ReleaseSequence {
                button: "up".to_string(),
            })
        );
    }

    #[test]
    fn hold_repeats_the_press_entry() {
        let mut resolver = ChordResolver::new(simple_table());

        resolver.resolve("KEY_UP", EventPhase::Press);
        assert_eq!(
            resolver.resolve("KEY_UP", EventPhase::Hold),
            Some(ResolvedAction::ForwardKey {
                button: "up".to_string(),
                phase: EventPhase::Hold,
            })
        );
    }

    #[test]
    fn hold_alone_never_arms_a_release() {
        let mut resolver = ChordResolver::new(simple_table());

        // A hold that was never preceded by a press (the press half got
        // lost with the connection) still forwards...
        resolver.resolve("KEY_LEFTSHIFT", EventPhase::Press);
        assert_eq!(
            resolver.resolve("KEY_A", EventPhase::Hold),
            Some(ResolvedAction::ForwardKey {
                button: "a".to_string(),
                phase: EventPhase::Hold,
            })
        );

        // ...but its release resolves nothing, because holds do not arm.
        assert_eq!(resolver.resolve("KEY_A", EventPhase::Release), None);
        assert_eq!(resolver.flags(), ModifierFlags::NONE);
    }

    #[test]
    fn special_command_fires_on_release_only() {
        let mut resolver = ChordResolver::new(simple_table());

        // The entry was normalized to phase=press, but commands are silent
        // on the press half and fire when the key is let go.
        assert_eq!(resolver.resolve("KEY_POWER", EventPhase::Press), None);
        assert_eq!(
            resolver.resolve("KEY_POWER", EventPhase::Release),
            Some(ResolvedAction::Special {
                command: "poweroff".to_string(),
            })
        );
    }

    #[test]
    fn custom_action_fires_on_release_only() {
        let mut resolver = ChordResolver::new(simple_table());

        assert_eq!(resolver.resolve("KEY_HOMEPAGE", EventPhase::Press), None);
        assert_eq!(
            resolver.resolve("KEY_HOMEPAGE", EventPhase::Release),
            Some(ResolvedAction::Custom {
                payload: "ActivateWindow(Home)".to_string(),
            })
        );
    }

    #[test]
    fn unmapped_release_clears_modifier_state() {
        let mut resolver = ChordResolver::new(simple_table());

        resolver.resolve("KEY_LEFTSHIFT", EventPhase::Press);
        resolver.resolve("KEY_LEFTCTRL", EventPhase::Press);
        assert_eq!(resolver.resolve("KEY_Z", EventPhase::Release), None);
        assert_eq!(resolver.flags(), ModifierFlags::NONE);
    }

    #[test]
    fn unmapped_press_resolves_nothing() {
        let mut resolver = ChordResolver::new(simple_table());

        assert_eq!(resolver.resolve("KEY_Z", EventPhase::Press), None);
        assert_eq!(resolver.resolve("KEY_Z", EventPhase::Release), None);
    }

    #[test]
    fn reset_clears_armed_press_and_flags() {
        let mut resolver = ChordResolver::new(simple_table());

        resolver.resolve("KEY_LEFTSHIFT", EventPhase::Press);
        resolver.resolve("KEY_A", EventPhase::Press);
        resolver.reset();

        assert_eq!(resolver.flags(), ModifierFlags::NONE);
        // The armed press died with the old event stream.
        assert_eq!(resolver.resolve("KEY_A", EventPhase::Release), None);
    }
}
