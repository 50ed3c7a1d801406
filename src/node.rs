//! Node orchestration: `StreamletNode` owns the
//! consensus engine, the transport handle, and the epoch timer, driving
//! them from a single task so every state transition is serialized —
//! mirrors `bach-node`'s `BachNode` (config → init → start → stop/Drop),
//! with the `// TODO: Start consensus engine` stubs that crate left behind
//! actually filled in here.

use crate::config::{Cli, LaunchConfig};
use crate::consensus::{ConsensusEngine, EngineOutput};
use crate::error::{EngineError, EngineResult};
use crate::message::{Envelope, Message};
use crate::persistence;
use crate::transaction::Transaction;
use crate::transport::{self, TransportConfig, TransportHandle};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;

/// How long a rejoining node waits for `RESPONSE_MISSING_BLOCKS` replies
/// before giving up and running the epoch loop on whatever chain it has.
const RECOVERY_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Stopped,
    Starting,
    Running,
    ShuttingDown,
}

pub struct StreamletNode {
    id: usize,
    engine: ConsensusEngine,
    config: LaunchConfig,
    data_dir: PathBuf,
    rejoin: bool,
    listen_port: u16,
    peers: HashMap<usize, SocketAddr>,
    transport: Option<TransportHandle>,
    inbound: Option<mpsc::UnboundedReceiver<Envelope>>,
    state: NodeState,
}

impl StreamletNode {
    /// Loads the launch config and any persisted chain, builds the engine,
    /// but does not yet touch the network.
    pub fn new(cli: Cli) -> EngineResult<Self> {
        let config = LaunchConfig::from_file(&cli.config_path)?;
        config.validate()?;

        let listen_port = cli.port.unwrap_or(config.port_for(cli.node_id)?);
        let peers: HashMap<usize, SocketAddr> = (0..config.num_nodes)
            .filter(|&i| i != cli.node_id)
            .map(|i| (i, SocketAddr::from(([127, 0, 0, 1], config.ports[i]))))
            .collect();

        let mut engine = ConsensusEngine::new(
            cli.node_id,
            config.num_nodes,
            config.leader_seed(),
            config.confusion_start,
            config.confusion_duration,
        );

        std::fs::create_dir_all(&cli.data_dir)
            .map_err(|e| EngineError::Config(format!("creating data dir: {e}")))?;
        let chain_path = persistence::chain_file_path(&cli.data_dir, cli.node_id);
        engine.chain = persistence::load_chain(&chain_path)?;

        tracing::info!(
            node = cli.node_id,
            finalized_tip_epoch = engine.chain.get(&engine.chain.finalized_tip()).map_or(0, |b| b.epoch),
            "loaded persisted chain"
        );

        Ok(StreamletNode {
            id: cli.node_id,
            engine,
            config,
            data_dir: cli.data_dir,
            rejoin: cli.rejoin,
            listen_port,
            peers,
            transport: None,
            inbound: None,
            state: NodeState::Stopped,
        })
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    /// Admits a client transaction and, if accepted, announces it so other
    /// participants can pick it up before the leader proposes.
    pub fn submit_transaction(&mut self, tx: Transaction) -> bool {
        let epoch = self.engine.current_epoch() + 1;
        let accepted = self.engine.submit_transaction(tx.clone());
        if accepted {
            if let Some(handle) = &self.transport {
                handle.broadcast(Message::EchoTransaction {
                    transaction: tx,
                    epoch,
                });
            }
        }
        accepted
    }

    async fn start(&mut self) -> EngineResult<()> {
        self.state = NodeState::Starting;
        let listen_addr = SocketAddr::from(([0, 0, 0, 0], self.listen_port));
        let tconfig = TransportConfig::new(self.id, listen_addr, self.peers.clone());
        let (handle, inbound) = transport::spawn(tconfig).await?;

        if self.rejoin {
            let last_epoch = self
                .engine
                .chain
                .get(&self.engine.chain.finalized_tip())
                .map_or(0, |b| b.epoch);
            tracing::info!(node = self.id, last_epoch, "rejoining: requesting missing blocks");
            handle.broadcast(Message::QueryMissingBlocks { last_epoch });
        }

        self.transport = Some(handle);
        self.inbound = Some(inbound);
        self.state = NodeState::Running;
        tracing::info!(node = self.id, port = self.listen_port, "node started");
        Ok(())
    }

    /// Runs the epoch timer and inbound dispatch loop until `total_epochs`
    /// is reached, then shuts down gracefully.
    pub async fn run(&mut self) -> EngineResult<()> {
        self.start().await?;

        let mut inbound = self.inbound.take().expect("start() set this");
        let epoch_duration = self.config.epoch_duration();
        let total_epochs = self.config.total_epochs;

        let initial_delay = if self.rejoin {
            Duration::ZERO
        } else {
            self.config.delay_until_start(SystemTime::now())?
        };
        let mut next_tick = tokio::time::Instant::now() + initial_delay;

        // Resume where the chain we already hold leaves off, rather than
        // always restarting at epoch 1 — load_chain/recovery may have left
        // us already notarized past epoch 0 by the time the loop starts.
        let max_notarized_epoch = self
            .engine
            .chain
            .get(&self.engine.chain.longest_notarized_tip())
            .map_or(0, |b| b.epoch);
        let mut next_epoch: u64 = max_notarized_epoch + 1;

        let mut recovery_deadline = if self.rejoin {
            Some(tokio::time::Instant::now() + RECOVERY_TIMEOUT)
        } else {
            None
        };

        loop {
            if next_epoch > total_epochs {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep_until(next_tick) => {
                    let out = self.engine.begin_epoch(next_epoch);
                    self.dispatch(out)?;
                    next_epoch += 1;
                    next_tick += epoch_duration;
                }
                maybe_envelope = inbound.recv() => {
                    match maybe_envelope {
                        Some(envelope) => {
                            let out = self.engine.on_envelope(&envelope);
                            self.dispatch(out)?;
                        }
                        None => break,
                    }
                }
                _ = tokio::time::sleep_until(recovery_deadline.unwrap_or_else(tokio::time::Instant::now)), if recovery_deadline.is_some() => {
                    tracing::warn!(
                        node = self.id,
                        error = %EngineError::RecoveryTimeout(RECOVERY_TIMEOUT),
                        "recovery window elapsed, proceeding with partial chain"
                    );
                    recovery_deadline = None;
                }
            }
        }

        self.inbound = Some(inbound);
        self.shutdown().await
    }

    fn dispatch(&mut self, out: EngineOutput) -> EngineResult<()> {
        let handle = self
            .transport
            .as_ref()
            .ok_or_else(|| EngineError::Transport("node not started".into()))?;
        for message in out.broadcast {
            handle.broadcast(message);
        }
        for (peer, message) in out.replies {
            handle.reply_to(peer, message);
        }
        for finalized in &out.newly_finalized {
            tracing::info!(node = self.id, block = %finalized, "persisting newly finalized block");
        }
        if !out.newly_finalized.is_empty() {
            self.persist()?;
        }
        Ok(())
    }

    fn persist(&self) -> EngineResult<()> {
        let path = persistence::chain_file_path(&self.data_dir, self.id);
        persistence::save_chain(&path, &self.engine.chain)
    }

    pub async fn shutdown(&mut self) -> EngineResult<()> {
        if self.state == NodeState::Stopped {
            return Ok(());
        }
        self.state = NodeState::ShuttingDown;
        if let Some(handle) = self.transport.take() {
            handle.shutdown();
        }
        self.persist()?;
        self.state = NodeState::Stopped;
        tracing::info!(node = self.id, "node stopped");
        Ok(())
    }
}

impl Drop for StreamletNode {
    fn drop(&mut self) {
        if self.state != NodeState::Stopped {
            tracing::warn!(node = self.id, "node dropped without a graceful shutdown");
            let _ = self.persist();
        }
    }
}
