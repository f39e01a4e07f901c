use thiserror::Error;

/// What the editor binding is doing with the live document right now
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncPhase {
    #[default]
    Idle,
    ApplyingRemote,
    RenderingDecorations,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cannot enter {requested:?} while {current:?}")]
pub struct PhaseConflict {
    pub current: SyncPhase,
    pub requested: SyncPhase,
}

/// Guarded transitions between remote application and decoration rendering.
///
/// Remote updates always win: they may start while decorations are rendering,
/// which marks that render stale. Decorations requested during a remote
/// application are deferred and reported when the application finishes.
#[derive(Debug, Default)]
pub struct EditorSyncState {
    phase: SyncPhase,
    decorations_pending: bool,
    decorations_stale: bool,
}

impl EditorSyncState {
    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn begin_remote(&mut self) -> Result<(), PhaseConflict> {
        match self.phase {
            SyncPhase::ApplyingRemote => Err(PhaseConflict {
                current: self.phase,
                requested: SyncPhase::ApplyingRemote,
            }),
            SyncPhase::RenderingDecorations => {
                self.decorations_stale = true;
                self.phase = SyncPhase::ApplyingRemote;
                Ok(())
            }
            SyncPhase::Idle => {
                self.phase = SyncPhase::ApplyingRemote;
                Ok(())
            }
        }
    }

    /// Back to idle. Returns `true` when decorations were deferred meanwhile.
    pub fn finish_remote(&mut self) -> bool {
        if self.phase == SyncPhase::ApplyingRemote {
            self.phase = SyncPhase::Idle;
        }
        std::mem::take(&mut self.decorations_pending)
    }

    pub fn begin_decorations(&mut self) -> Result<(), PhaseConflict> {
        match self.phase {
            SyncPhase::Idle => {
                self.phase = SyncPhase::RenderingDecorations;
                self.decorations_stale = false;
                Ok(())
            }
            current => {
                if current == SyncPhase::ApplyingRemote {
                    self.decorations_pending = true;
                }
                Err(PhaseConflict {
                    current,
                    requested: SyncPhase::RenderingDecorations,
                })
            }
        }
    }

    /// Back to idle. Returns `true` when a remote update landed mid-render and
    /// the decorations must be drawn again.
    pub fn finish_decorations(&mut self) -> bool {
        if self.phase == SyncPhase::RenderingDecorations {
            self.phase = SyncPhase::Idle;
        }
        let stale = std::mem::take(&mut self.decorations_stale);
        if stale {
            self.decorations_pending = self.phase == SyncPhase::ApplyingRemote;
        }
        stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_application_is_not_reentrant() {
        let mut state = EditorSyncState::default();
        state.begin_remote().unwrap();
        assert_eq!(
            state.begin_remote(),
            Err(PhaseConflict {
                current: SyncPhase::ApplyingRemote,
                requested: SyncPhase::ApplyingRemote,
            })
        );
        assert!(!state.finish_remote());
        assert_eq!(state.phase(), SyncPhase::Idle);
    }

    #[test]
    fn decorations_are_deferred_during_remote_application() {
        let mut state = EditorSyncState::default();
        state.begin_remote().unwrap();
        assert!(state.begin_decorations().is_err());
        assert!(state.finish_remote());
        state.begin_decorations().unwrap();
        assert!(!state.finish_decorations());
    }

    #[test]
    fn remote_update_marks_running_render_stale() {
        let mut state = EditorSyncState::default();
        state.begin_decorations().unwrap();
        state.begin_remote().unwrap();
        // Render ends while the remote application is still running
        assert!(state.finish_decorations());
        assert_eq!(state.phase(), SyncPhase::ApplyingRemote);
        assert!(state.finish_remote());
        assert_eq!(state.phase(), SyncPhase::Idle);
    }
}
