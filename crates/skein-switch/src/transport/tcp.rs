//! Agent transport over TCP, one connection per request

use super::codec::{
    StreamHeader, decode_message, frame_kind, read_frame, read_reply, read_stream, write_message,
    write_stream,
};
use super::{AgentClient, AgentConnector};
use crate::agent::AgentService;
use crate::context::EngineConfig;
use crate::directory::NodeDirectory;
use crate::error::{Result, SwitchError, WireError};
use crate::plan::{NodeId, Plan, PlanId};
use crate::stream::{ByteStream, pipe};
use crate::switch::Results;
use crate::var::VarId;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Resolves node ids through a [`NodeDirectory`]
pub struct TcpAgentConnector {
    directory: Arc<dyn NodeDirectory>,
    config: EngineConfig,
}

impl TcpAgentConnector {
    pub fn new(directory: Arc<dyn NodeDirectory>, config: EngineConfig) -> Self {
        Self { directory, config }
    }
}

#[async_trait]
impl AgentConnector for TcpAgentConnector {
    async fn connect(&self, node: NodeId) -> Result<Arc<dyn AgentClient>> {
        let info = self
            .directory
            .list_nodes()
            .await?
            .into_iter()
            .find(|n| n.id == node)
            .ok_or_else(|| SwitchError::Transport(format!("{} is not in the directory", node)))?;
        Ok(Arc::new(TcpAgentClient::new(info.address, self.config.clone())))
    }
}

/// Client for one agent address
pub struct TcpAgentClient {
    address: String,
    config: EngineConfig,
}

impl TcpAgentClient {
    pub fn new(address: impl Into<String>, config: EngineConfig) -> Self {
        Self {
            address: address.into(),
            config,
        }
    }

    async fn open(&self) -> Result<TcpStream> {
        let stream = TcpStream::connect(&self.address)
            .await
            .map_err(|e| SwitchError::Transport(format!("connect {}: {}", self.address, e)))?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

#[async_trait]
impl AgentClient for TcpAgentClient {
    async fn execute_plan(&self, plan: Plan) -> Result<Results> {
        let mut conn = self.open().await?;
        write_message(&mut conn, frame_kind::EXECUTE, &plan).await?;
        read_reply(&mut conn).await
    }

    async fn send_stream(&self, plan: &PlanId, var: VarId, stream: ByteStream) -> Result<()> {
        let mut conn = self.open().await?;
        let header = StreamHeader {
            plan: plan.clone(),
            var,
        };
        write_message(&mut conn, frame_kind::SEND_STREAM, &header).await?;
        let sent = write_stream(&mut conn, stream, self.config.copy_buffer_size).await?;
        debug!(plan = %plan, var = %var, bytes = sent, address = %self.address, "stream pushed");
        read_reply(&mut conn).await
    }

    async fn fetch_stream(&self, plan: &PlanId, var: VarId) -> Result<ByteStream> {
        let mut conn = self.open().await?;
        let header = StreamHeader {
            plan: plan.clone(),
            var,
        };
        write_message(&mut conn, frame_kind::FETCH_STREAM, &header).await?;
        read_reply::<_, ()>(&mut conn).await?;

        let (writer, reader) = pipe(self.config.pipe_depth);
        let plan = plan.clone();
        tokio::spawn(async move {
            if let Err(e) = read_stream(&mut conn, writer).await {
                warn!(plan = %plan, var = %var, error = %e, "fetched stream broke off");
            }
        });
        Ok(Box::new(reader))
    }
}

/// Accepts agent connections and serves them from an [`AgentService`]
pub struct TcpAgentServer {
    agent: Arc<AgentService>,
    listener: TcpListener,
}

impl TcpAgentServer {
    pub async fn bind(address: &str, agent: Arc<AgentService>) -> Result<Self> {
        let listener = TcpListener::bind(address).await?;
        Ok(Self { agent, listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` fires
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        info!(address = %self.local_addr()?, "agent server listening");
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (conn, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let agent = self.agent.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(agent, conn).await {
                            warn!(peer = %peer, error = %e, "connection failed");
                        }
                    });
                }
                _ = shutdown.cancelled() => {
                    info!("agent server stopping");
                    self.agent.shutdown();
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_connection(agent: Arc<AgentService>, conn: TcpStream) -> Result<()> {
    conn.set_nodelay(true)?;
    let (mut rd, mut wr) = conn.into_split();
    let Some(request) = read_frame(&mut rd).await? else {
        return Ok(());
    };

    match request.kind {
        frame_kind::EXECUTE => {
            let plan: Plan = decode_message(&request.payload)?;
            let id = plan.id.clone();
            let outcome = tokio::select! {
                r = agent.execute_plan(plan) => Some(r),
                _ = wait_closed(&mut rd) => None,
            };
            match outcome {
                Some(result) => reply(&mut wr, result).await,
                None => {
                    debug!(plan = %id, "dispatcher disconnected, plan aborted");
                    Ok(())
                }
            }
        }
        frame_kind::SEND_STREAM => {
            let header: StreamHeader = decode_message(&request.payload)?;
            let (writer, reader) = pipe(agent.context().config().pipe_depth);
            let (received, pumped) = tokio::join!(
                agent.receive_stream(&header.plan, header.var, Box::new(reader)),
                read_stream(&mut rd, writer),
            );
            let result = received.and(pumped.map(|_| ()));
            reply(&mut wr, result).await
        }
        frame_kind::FETCH_STREAM => {
            let header: StreamHeader = decode_message(&request.payload)?;
            match agent.serve_stream(&header.plan, header.var).await {
                Ok(stream) => {
                    reply(&mut wr, Ok(())).await?;
                    let chunk = agent.context().config().copy_buffer_size;
                    write_stream(&mut wr, stream, chunk).await?;
                    Ok(())
                }
                Err(e) => reply::<_, ()>(&mut wr, Err(e)).await,
            }
        }
        other => Err(SwitchError::Protocol(format!(
            "unexpected request frame kind {:#04x}",
            other
        ))),
    }
}

async fn reply<W, T>(w: &mut W, result: Result<T>) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: serde::Serialize,
{
    match result {
        Ok(value) => write_message(w, frame_kind::RESULT, &value).await,
        Err(e) => write_message(w, frame_kind::ERROR, &WireError::from(&e)).await,
    }
}

/// Completes when the peer closes its side or the connection fails
async fn wait_closed<R: AsyncRead + Unpin>(r: &mut R) {
    let mut buf = [0u8; 64];
    loop {
        match r.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => continue,
        }
    }
}
