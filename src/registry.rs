//! Agent registry and lifecycle management.
//!
//! Maps each channel's [`AgentUserId`] to at most one live [`Agent`].
//! Membership changes (check pending/live, then commit) happen under one
//! synchronous lock and never span an await. Construction, stop and idle
//! teardown for the same id additionally run under a per-id async lock,
//! so a teardown that is still talking to the transport cannot interleave
//! with a new construction for that id.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::adapters::ChatServer;
use crate::agent::{Agent, AgentUserId, ChannelIdentity, ModelFactory, UserProfile};
use crate::config::Config;
use crate::Result;

/// Connection status of a channel's agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Connected,
    Connecting,
    Disconnected,
}

/// What `start` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new agent was built and installed.
    Started,
    /// An agent was already live or under construction.
    AlreadyRunning,
    /// Another path installed an agent first; the one built here was disposed.
    Discarded,
}

/// Registry tunables.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub agent_name: String,
    pub sweep_interval: Duration,
    pub idle_threshold: chrono::Duration,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl RegistrySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            agent_name: config.agent_name.clone(),
            sweep_interval: config.sweep_interval(),
            idle_threshold: config.idle_threshold(),
        }
    }
}

#[derive(Default)]
struct Maps {
    live: HashMap<AgentUserId, Arc<Agent>>,
    pending: HashSet<AgentUserId>,
    locks: HashMap<AgentUserId, Arc<tokio::sync::Mutex<()>>>,
}

struct Sweeper {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Owns every live agent plus the sweep task.
pub struct AgentRegistry {
    server: Arc<dyn ChatServer>,
    models: ModelFactory,
    settings: RegistrySettings,
    maps: Mutex<Maps>,
    sweeper: Mutex<Option<Sweeper>>,
}

/// Clears a pending marker however construction ends.
struct PendingGuard<'a> {
    registry: &'a AgentRegistry,
    user_id: AgentUserId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.registry.maps().pending.remove(&self.user_id);
    }
}

/// Holds the per-id lock; the lock entry is dropped once nobody uses it.
struct IdGuard<'a> {
    registry: &'a AgentRegistry,
    user_id: AgentUserId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for IdGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut maps = self.registry.maps();
        let unused = maps
            .locks
            .get(&self.user_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1);
        if unused {
            maps.locks.remove(&self.user_id);
        }
    }
}

impl AgentRegistry {
    pub fn new(server: Arc<dyn ChatServer>, models: ModelFactory, settings: RegistrySettings) -> Self {
        Self {
            server,
            models,
            settings,
            maps: Mutex::new(Maps::default()),
            sweeper: Mutex::new(None),
        }
    }

    fn maps(&self) -> MutexGuard<'_, Maps> {
        self.maps.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enter the critical section for one id.
    async fn serialize(&self, user_id: &AgentUserId) -> IdGuard<'_> {
        // declared first so a cancelled wait still cleans up the entry
        let mut guard = IdGuard {
            registry: self,
            user_id: user_id.clone(),
            guard: None,
        };
        // waiters hold a clone, so the entry outlives every queued caller
        let lock = {
            let mut maps = self.maps();
            Arc::clone(maps.locks.entry(user_id.clone()).or_default())
        };
        guard.guard = Some(lock.lock_owned().await);
        guard
    }

    /// Start the channel's agent unless one is live or being built.
    pub async fn start(&self, channel: &ChannelIdentity) -> Result<StartOutcome> {
        let user_id = channel.agent_user_id();

        {
            let mut maps = self.maps();
            let running = maps.live.get(&user_id).is_some_and(|agent| !agent.is_closed());
            if running || maps.pending.contains(&user_id) {
                info!(agent = %user_id, "Agent already started or is pending");
                return Ok(StartOutcome::AlreadyRunning);
            }
            maps.pending.insert(user_id.clone());
        }
        let _pending = PendingGuard {
            registry: self,
            user_id: user_id.clone(),
        };

        let _serial = self.serialize(&user_id).await;

        let stale = {
            let mut maps = self.maps();
            match maps.live.get(&user_id) {
                Some(agent) if agent.is_closed() => maps.live.remove(&user_id),
                _ => None,
            }
        };
        if let Some(stale) = stale {
            info!(agent = %user_id, "Replacing agent whose connection was lost");
            if let Err(e) = self.teardown(&stale).await {
                warn!(agent = %user_id, "Failed to tear down disconnected agent: {}", e);
            }
        }

        info!(agent = %user_id, channel = %channel, "Creating new agent");
        let agent = self.build(channel, &user_id).await?;

        // re-validate after the awaits above
        let installed = {
            let mut maps = self.maps();
            if maps.live.contains_key(&user_id) {
                false
            } else {
                maps.live.insert(user_id.clone(), Arc::clone(&agent));
                true
            }
        };

        if installed {
            info!(agent = %user_id, "Agent started");
            Ok(StartOutcome::Started)
        } else {
            info!(agent = %user_id, "Agent raced with another start; discarding duplicate");
            if let Err(e) = agent.dispose().await {
                warn!(agent = %user_id, "Failed to dispose duplicate agent: {}", e);
            }
            Ok(StartOutcome::Discarded)
        }
    }

    async fn build(&self, channel: &ChannelIdentity, user_id: &AgentUserId) -> Result<Arc<Agent>> {
        let model = (self.models)()?;

        self.server
            .upsert_user(&UserProfile::new(user_id.as_str(), &self.settings.agent_name))
            .await?;
        self.server
            .add_members(channel, &[user_id.to_string()])
            .await?;

        let connection = self.server.connect_user(user_id).await?;
        let agent = Arc::new(Agent::new(channel.clone(), Arc::clone(&connection), model));

        let ready = async {
            connection.watch(channel).await?;
            agent.init()
        };
        if let Err(e) = ready.await {
            if let Err(dispose_err) = agent.dispose().await {
                debug!(agent = %user_id, "Cleanup after failed start: {}", dispose_err);
            }
            return Err(e);
        }
        Ok(agent)
    }

    /// Stop and remove the channel's agent; no-op when there is none.
    pub async fn stop(&self, channel: &ChannelIdentity) -> Result<()> {
        let user_id = channel.agent_user_id();
        let _serial = self.serialize(&user_id).await;

        let agent = self.maps().live.remove(&user_id);
        match agent {
            Some(agent) => {
                info!(agent = %user_id, "Disposing agent");
                self.teardown(&agent).await
            }
            None => {
                debug!(agent = %user_id, "No live agent to stop");
                Ok(())
            }
        }
    }

    /// Dispose the agent, then hard-delete its chat user (best effort).
    async fn teardown(&self, agent: &Agent) -> Result<()> {
        let disposed = agent.dispose().await;
        if let Err(e) = self.server.delete_user(agent.user_id().as_str(), true).await {
            warn!(agent = %agent.user_id(), "Failed to delete agent user: {}", e);
        }
        disposed
    }

    pub fn status(&self, channel: &ChannelIdentity) -> AgentStatus {
        let user_id = channel.agent_user_id();
        let maps = self.maps();
        if maps.live.get(&user_id).is_some_and(|agent| !agent.is_closed()) {
            AgentStatus::Connected
        } else if maps.pending.contains(&user_id) {
            AgentStatus::Connecting
        } else {
            AgentStatus::Disconnected
        }
    }

    pub fn active_count(&self) -> usize {
        self.maps().live.values().filter(|agent| !agent.is_closed()).count()
    }

    pub fn get(&self, channel: &ChannelIdentity) -> Option<Arc<Agent>> {
        self.maps().live.get(&channel.agent_user_id()).cloned()
    }

    /// Dispose every agent idle longer than the threshold at `now`, and
    /// every agent whose connection was lost.
    ///
    /// Returns the ids that were swept. Failures are logged and the
    /// sweep moves on to the next agent.
    pub async fn sweep_idle(&self, now: DateTime<Utc>) -> Vec<AgentUserId> {
        let threshold = self.settings.idle_threshold;
        let expired = |agent: &Agent| agent.is_closed() || now - agent.last_interaction() > threshold;
        let candidates: Vec<AgentUserId> = self
            .maps()
            .live
            .iter()
            .filter(|(_, agent)| expired(agent))
            .map(|(id, _)| id.clone())
            .collect();

        let mut swept = Vec::with_capacity(candidates.len());
        for user_id in candidates {
            let _serial = self.serialize(&user_id).await;

            // the agent may have been stopped, replaced or used meanwhile
            let agent = {
                let mut maps = self.maps();
                match maps.live.get(&user_id) {
                    Some(agent) if expired(agent) => maps.live.remove(&user_id),
                    _ => None,
                }
            };
            let Some(agent) = agent else {
                continue;
            };

            if agent.is_closed() {
                info!(agent = %user_id, "Disposing agent whose connection was lost");
            } else {
                info!(agent = %user_id, "Disposing agent due to inactivity");
            }
            if let Err(e) = self.teardown(&agent).await {
                warn!(agent = %user_id, "Idle teardown failed: {}", e);
            }
            swept.push(user_id);
        }
        swept
    }

    /// Run [`AgentRegistry::sweep_idle`] on a fixed interval until shutdown.
    ///
    /// A sweep that has started always finishes its teardowns; the stop
    /// signal is only observed between sweeps.
    pub fn spawn_sweeper(self: &Arc<Self>) {
        let registry = Arc::downgrade(self);
        let interval = self.settings.sweep_interval;
        let (stop, mut stopped) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stopped.changed() => break,
                }
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.sweep_idle(Utc::now()).await;
            }
            debug!("Sweeper stopped");
        });

        let previous = self
            .sweeper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(Sweeper { stop, handle });
        if let Some(previous) = previous {
            let _ = previous.stop.send(true);
        }
    }

    /// Stop the sweeper, wait for a sweep in progress, then tear down
    /// every live agent.
    pub async fn shutdown(&self) {
        let sweeper = self.sweeper.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(Sweeper { stop, handle }) = sweeper {
            let _ = stop.send(true);
            if let Err(e) = handle.await {
                warn!("Sweeper task failed: {}", e);
            }
        }

        let channels: Vec<ChannelIdentity> = self
            .maps()
            .live
            .values()
            .map(|agent| agent.identity().clone())
            .collect();
        info!("Shutting down {} agent(s)", channels.len());

        for channel in channels {
            if let Err(e) = self.stop(&channel).await {
                warn!(channel = %channel, "Failed to stop agent during shutdown: {}", e);
            }
        }
    }
}
