//! Record and replay of executed movements
//!
//! Recording captures every movement the scheduler dispatches (plus the local
//! character's own moves) against the live clock. Playback leaves live
//! synchronization, feeds the log through a dedicated queue on a separate
//! replay clock and rejoins with a fresh handshake once the end marker is
//! dispatched.

use crate::clock::Clock;
use crate::game::GameObjects;
use crate::network::{Client, ClientError};
use crate::scheduler::Notice;
use log::{info, warn};
use shared::{Event, REPLAY_QUEUE_KEY};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayState {
    Idle,
    Recording,
    Playing,
}

impl fmt::Display for ReplayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReplayState::Idle => "idle",
            ReplayState::Recording => "recording",
            ReplayState::Playing => "playing",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("cannot {operation} while {state}")]
    InvalidTransition {
        operation: &'static str,
        state: ReplayState,
    },
    #[error("no finished recording to play")]
    NothingRecorded,
    #[error("invalid replay speed {0}")]
    InvalidSpeed(f64),
    #[error(transparent)]
    Client(#[from] ClientError),
}

pub struct Replay<O> {
    state: ReplayState,
    live_time: Arc<dyn Clock>,
    replay_time: Arc<dyn Clock>,
    /// Live clock reading when the current recording began
    start_time: f64,
    client: Arc<Client<O>>,
}

impl<O: GameObjects + 'static> Replay<O> {
    pub fn new(
        live_time: Arc<dyn Clock>,
        replay_time: Arc<dyn Clock>,
        client: Arc<Client<O>>,
    ) -> Self {
        replay_time.set_paused(true);
        Self {
            state: ReplayState::Idle,
            live_time,
            replay_time,
            start_time: 0.0,
            client,
        }
    }

    pub fn state(&self) -> ReplayState {
        self.state
    }

    pub fn start_time(&self) -> f64 {
        self.start_time
    }

    fn expect_state(
        &self,
        expected: ReplayState,
        operation: &'static str,
    ) -> Result<(), ReplayError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(ReplayError::InvalidTransition {
                operation,
                state: self.state,
            })
        }
    }

    pub async fn start_recording(&mut self) -> Result<(), ReplayError> {
        self.expect_state(ReplayState::Idle, "start recording")?;

        self.replay_time.restart();
        self.replay_time.set_paused(true);
        self.start_time = self.live_time.current_time();
        self.client.manager().stage().lock().await.recorder.start();

        self.state = ReplayState::Recording;
        info!("Recording started at {:.3}", self.start_time);
        Ok(())
    }

    /// Seals the log with an end marker at the current live time
    pub async fn end_recording(&mut self) -> Result<(), ReplayError> {
        self.expect_state(ReplayState::Recording, "end recording")?;

        let end_time = self.live_time.current_time();
        let mut stage = self.client.manager().stage().lock().await;
        stage.recorder.finish(Event::end_playback(end_time));
        let captured = stage.recorder.len() - 1;
        drop(stage);

        self.state = ReplayState::Idle;
        info!(
            "Recording finished: {} movements over {:.3}",
            captured,
            end_time - self.start_time
        );
        Ok(())
    }

    pub async fn start_playing(&mut self) -> Result<(), ReplayError> {
        self.expect_state(ReplayState::Idle, "start playing")?;

        let log = {
            let mut stage = self.client.manager().stage().lock().await;
            if !stage.recorder.is_sealed() {
                return Err(ReplayError::NothingRecorded);
            }
            stage.recorder.take_log()
        };

        // Peers drop us either way; a lost notice is covered by the server lease
        if let Err(e) = self.client.disconnect(true).await {
            warn!("Disconnect notice for replay failed: {}", e);
        }

        {
            let mut registry = self.client.manager().registry().lock().await;
            registry.set_timeline(Arc::clone(&self.replay_time));
            registry.set_claim(REPLAY_QUEUE_KEY, f64::INFINITY);
            for event in log {
                registry.insert_event(event.shifted(-self.start_time), REPLAY_QUEUE_KEY);
            }
            info!(
                "Playing back {} events",
                registry.queue_len(REPLAY_QUEUE_KEY).unwrap_or_default()
            );
        }

        self.replay_time.set_paused(false);
        self.state = ReplayState::Playing;
        Ok(())
    }

    /// Returns to live synchronization with a fresh handshake
    pub async fn end_playing(&mut self) -> Result<(), ReplayError> {
        self.expect_state(ReplayState::Playing, "end playing")?;

        self.replay_time.set_paused(true);
        {
            let mut registry = self.client.manager().registry().lock().await;
            registry.set_timeline(Arc::clone(&self.live_time));
            registry.session.replaying = false;
            registry.remove_source(REPLAY_QUEUE_KEY);

            let mut stage = self.client.manager().stage().lock().await;
            stage.recorder.clear();
            stage.clear_outbound();
        }

        self.state = ReplayState::Idle;
        info!("Playback finished, reconnecting");
        self.client.connect().await?;
        Ok(())
    }

    /// Reacts to a scheduler notice
    pub async fn handle_notice(&mut self, notice: Notice) -> Result<(), ReplayError> {
        match notice {
            Notice::PlaybackFinished => self.end_playing().await,
        }
    }

    /// Playback speed as a multiple of real time
    pub async fn reset_play_speed(&self, speed: f64) -> Result<(), ReplayError> {
        if !speed.is_finite() || speed <= 0.0 {
            return Err(ReplayError::InvalidSpeed(speed));
        }

        let _registry = self.client.manager().registry().lock().await;
        self.replay_time.reset_step_size(1.0 / speed);
        info!("Replay speed set to {:.2}x", speed);
        Ok(())
    }
}
