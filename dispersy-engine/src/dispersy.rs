//! The process-wide engine context.
//!
//! [`Dispersy`] is constructed once at startup with its configuration,
//! database and transport, and handed by value (it is cheap to clone) to
//! whatever needs it. It owns the scheduler, the member cache and the table
//! of loaded communities.
//!
//! # Example
//!
//! ```ignore
//! let dispersy = Dispersy::new(EngineConfig::default(), database, transport);
//! dispersy.start()?;
//!
//! let me = Member::generate();
//! let community = dispersy.create_community(&me, |cid| {
//!     Ok(vec![MetaMessage::builder("post", PayloadKind::Application)
//!         .distribution(Distribution::full_sync())
//!         .build(cid)?])
//! })?;
//! community.lock().create_message("post", Payload::Application { data })?;
//!
//! // from the socket reader
//! dispersy.on_incoming_packets(vec![(address, packet)]);
//! ```

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{mpsc, Arc, Weak};
use std::time::Duration;

use dispersy_core::{DropReason, Member, MemberError, MetaMessage, PolicyError};
use dispersy_types::{Cid, ConversionPrefix, Permission};
use parking_lot::{Mutex, RwLock};

use crate::community::{builtin, Community, Verdict};
use crate::config::EngineConfig;
use crate::error::{Result, StoreError, TaskError};
use crate::identity::MemberCache;
use crate::scheduler::{Resumable, Scheduler, Step, Task, TaskId};
use crate::store::{CommunityRow, Database, NewCommunity};
use crate::transport::Transport;

/// Id of the periodic sync task.
pub const SYNC_TASK: &str = "dispersy-sync-rounds";

/// How often a caller waiting on the scheduler checks that it still runs.
const WORKER_POLL: Duration = Duration::from_millis(100);

/// Shared handle to a loaded community.
pub type CommunityHandle = Arc<Mutex<Community>>;

type Communities = RwLock<HashMap<Cid, CommunityHandle>>;

/// What every community needs from the process.
pub(crate) struct Context {
    pub(crate) config: EngineConfig,
    pub(crate) scheduler: Scheduler,
    pub(crate) database: Arc<dyn Database>,
    pub(crate) members: Arc<MemberCache>,
    pub(crate) transport: Arc<dyn Transport>,
}

/// Runs a sync round in every loaded community, then waits an interval.
struct SyncRounds {
    communities: Weak<Communities>,
    interval: Duration,
}

impl Resumable for SyncRounds {
    type Output = ();

    fn resume(&mut self) -> std::result::Result<Step<()>, TaskError> {
        let Some(communities) = self.communities.upgrade() else {
            return Ok(Step::Done(()));
        };
        let handles: Vec<CommunityHandle> = communities.read().values().cloned().collect();
        for handle in handles {
            let mut community = handle.lock();
            if let Err(e) = community.sync_round() {
                tracing::warn!("sync round for {} failed: {}", community.cid(), e);
            }
        }
        Ok(Step::Wait(self.interval))
    }
}

/// The engine.
#[derive(Clone)]
pub struct Dispersy {
    context: Arc<Context>,
    communities: Arc<Communities>,
}

impl Dispersy {
    /// Create an engine; nothing runs until [`start`](Self::start).
    pub fn new(
        config: EngineConfig,
        database: Arc<dyn Database>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let scheduler = Scheduler::new(config.scheduler.clone());
        let members = Arc::new(MemberCache::new(database.clone()));
        Self {
            context: Arc::new(Context {
                config,
                scheduler,
                database,
                members,
                transport,
            }),
            communities: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.context.config
    }

    /// The scheduler running all community work.
    pub fn scheduler(&self) -> &Scheduler {
        &self.context.scheduler
    }

    /// The storage collaborator.
    pub fn database(&self) -> &Arc<dyn Database> {
        &self.context.database
    }

    /// The process-wide member cache.
    pub fn members(&self) -> &MemberCache {
        &self.context.members
    }

    /// Start the scheduler and the periodic sync rounds.
    pub fn start(&self) -> Result<()> {
        self.context.scheduler.start(true)?;
        let interval = self.context.config.sync.interval();
        self.context.scheduler.persistent_register(
            SYNC_TASK,
            Task::resumable(SyncRounds {
                communities: Arc::downgrade(&self.communities),
                interval,
            })
            .delay(interval),
        );
        tracing::info!("dispersy started, sync every {:?}", interval);
        Ok(())
    }

    /// Stop the scheduler, waiting up to the configured timeout.
    pub fn stop(&self) -> Result<()> {
        self.context.scheduler.stop()?;
        tracing::info!("dispersy stopped");
        Ok(())
    }

    /// Create a new community with a fresh master key.
    ///
    /// `define` returns the community's own meta-messages. The creator is
    /// granted every right on every linear-resolution message, by a
    /// master-signed authorize, and its identity is published.
    pub fn create_community<F>(&self, my_member: &Member, define: F) -> Result<CommunityHandle>
    where
        F: FnOnce(Cid) -> std::result::Result<Vec<MetaMessage>, PolicyError>,
    {
        Self::require_key(my_member)?;
        let master = Member::generate();
        let cid = Cid::from_master_key(master.public_key());
        let registry = builtin::build_registry(cid, &self.context.config.sync, define(cid)?)?;
        let master_private_key = master
            .private_key()
            .ok_or_else(|| MemberError::NoPrivateKey(master.mid()))?;

        self.context.members.add_private(my_member);
        let row = self.context.database.create_community(NewCommunity {
            cid,
            master_public_key: master.public_key(),
            master_private_key: Some(master_private_key.as_slice()),
            user_public_key: my_member.public_key(),
        })?;
        self.context.members.add_private(&master);

        let handle = self.attach(&row, master, my_member.clone(), registry);
        {
            let mut community = handle.lock();
            let grants: Vec<_> = community
                .meta_messages()
                .filter(|meta| meta.resolution() == dispersy_core::Resolution::Linear)
                .flat_map(|meta| {
                    Permission::ALL
                        .into_iter()
                        .map(move |permission| (my_member.clone(), meta.name().to_string(), permission))
                })
                .collect();
            community.create_authorize(grants, true)?;
            community.create_identity()?;
        }
        tracing::info!("created community {}", cid);
        Ok(handle)
    }

    /// Join the community owned by `master_public_key`.
    pub fn join_community<F>(
        &self,
        master_public_key: &[u8],
        my_member: &Member,
        define: F,
    ) -> Result<CommunityHandle>
    where
        F: FnOnce(Cid) -> std::result::Result<Vec<MetaMessage>, PolicyError>,
    {
        Self::require_key(my_member)?;
        let master = self.context.members.get_or_create(master_public_key)?;
        let cid = Cid::from_master_key(master.public_key());
        let registry = builtin::build_registry(cid, &self.context.config.sync, define(cid)?)?;

        self.context.members.add_private(my_member);
        let row = self.context.database.create_community(NewCommunity {
            cid,
            master_public_key: master.public_key(),
            master_private_key: None,
            user_public_key: my_member.public_key(),
        })?;

        let handle = self.attach(&row, master, my_member.clone(), registry);
        handle.lock().create_identity()?;
        tracing::info!("joined community {}", cid);
        Ok(handle)
    }

    /// Load a stored community, rebuilding its state from the message log.
    ///
    /// Returns the loaded instance if the community is already loaded.
    pub fn load_community<F>(&self, cid: Cid, define: F) -> Result<CommunityHandle>
    where
        F: FnOnce(Cid) -> std::result::Result<Vec<MetaMessage>, PolicyError>,
    {
        if let Some(handle) = self.get_community(&cid) {
            return Ok(handle);
        }
        let row = self.context.database.community(&cid)?;
        let master = self.context.members.get_or_create(&row.master_public_key)?;
        let my_member = self.context.members.get_or_create(&row.user_public_key)?;
        if !my_member.has_private_key() {
            return Err(StoreError::MissingKey(my_member.mid().to_string()).into());
        }
        let registry = builtin::build_registry(cid, &self.context.config.sync, define(cid)?)?;

        let handle = self.attach(&row, master, my_member, registry);
        handle.lock().load_from_store();
        Ok(handle)
    }

    fn require_key(member: &Member) -> Result<()> {
        if member.has_private_key() {
            Ok(())
        } else {
            Err(MemberError::NoPrivateKey(member.mid()).into())
        }
    }

    fn attach(
        &self,
        row: &CommunityRow,
        master: Member,
        my_member: Member,
        registry: dispersy_core::MetaRegistry,
    ) -> CommunityHandle {
        let context = self.context.clone();
        let handle = Arc::new_cyclic(|this| {
            Mutex::new(Community::new(
                context,
                this.clone(),
                row,
                master,
                my_member,
                registry,
            ))
        });
        self.communities.write().insert(row.cid, handle.clone());
        handle
    }

    /// A loaded community.
    pub fn get_community(&self, cid: &Cid) -> Option<CommunityHandle> {
        self.communities.read().get(cid).cloned()
    }

    /// Every loaded community.
    pub fn communities(&self) -> Vec<CommunityHandle> {
        self.communities.read().values().cloned().collect()
    }

    /// Forget a loaded community; its stored data stays.
    pub fn unload_community(&self, cid: &Cid) -> Option<CommunityHandle> {
        let removed = self.communities.write().remove(cid);
        if removed.is_some() {
            tracing::info!("unloaded community {}", cid);
        }
        removed
    }

    /// Hand received datagrams to the scheduler thread.
    pub fn on_incoming_packets(&self, packets: Vec<(SocketAddr, Vec<u8>)>) -> TaskId {
        let dispersy = self.clone();
        self.context.scheduler.register(Task::call(move || {
            dispersy.process_now(packets);
            Ok(())
        }))
    }

    /// Process received datagrams and return the verdicts.
    ///
    /// Each packet is routed by the community id in its prefix. Returns one
    /// verdict per processed packet, including released delayed packets.
    /// While the scheduler runs the work happens on its thread and the
    /// caller waits; see [`run_on_worker`](Self::run_on_worker).
    pub fn process_packets(&self, packets: Vec<(SocketAddr, Vec<u8>)>) -> Vec<Verdict> {
        let dispersy = self.clone();
        self.run_on_worker(move || dispersy.process_now(packets))
            .unwrap_or_default()
    }

    /// Run `work` on the scheduler thread and wait for its result.
    ///
    /// Communities, their bloom index and their registry are only changed
    /// on that thread while it runs, so callers on other threads go through
    /// here. Before `start`, after `stop`, or on the scheduler thread itself
    /// `work` runs inline. Returns `None` when the scheduler shut down
    /// without running it.
    ///
    /// Must not be called while holding a community lock.
    pub fn run_on_worker<T, F>(&self, work: F) -> Option<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let scheduler = &self.context.scheduler;
        if !scheduler.is_running() || scheduler.is_current_thread() {
            return Some(work());
        }

        let (tx, rx) = mpsc::channel();
        scheduler.register(Task::call(move || {
            let _ = tx.send(work());
            Ok(())
        }));
        loop {
            match rx.recv_timeout(WORKER_POLL) {
                Ok(result) => return Some(result),
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
                Err(mpsc::RecvTimeoutError::Timeout) if scheduler.is_finished() => break,
                Err(mpsc::RecvTimeoutError::Timeout) => {}
            }
        }
        tracing::warn!("scheduler stopped before running submitted work");
        None
    }

    fn process_now(&self, packets: Vec<(SocketAddr, Vec<u8>)>) -> Vec<Verdict> {
        let mut verdicts = Vec::with_capacity(packets.len());
        for (address, packet) in packets {
            let Some(prefix) = ConversionPrefix::from_packet(&packet) else {
                tracing::debug!("dropping short packet from {}", address);
                verdicts.push(Err(DropReason::Malformed("packet shorter than its prefix".to_string()).into()));
                continue;
            };
            let Some(handle) = self.get_community(&prefix.cid()) else {
                tracing::debug!("dropping packet for unknown community {} from {}", prefix.cid(), address);
                verdicts.push(Err(DropReason::UnknownConversion.into()));
                continue;
            };
            let mut community = handle.lock();
            verdicts.extend(community.on_incoming_packets(vec![(Some(address), packet)]));
        }
        verdicts
    }
}

impl fmt::Debug for Dispersy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispersy")
            .field("scheduler", &self.context.scheduler)
            .field("members", &self.context.members)
            .field("communities", &self.communities.read().len())
            .finish()
    }
}
