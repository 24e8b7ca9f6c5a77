use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use chorus_crypto::{CryptoSuite, VoiceTokenVerifier};
use chorus_proto::{
    control, Bye, HelloPayload, MediaStateUpdate, Nack, PacketType, Pli, ReceiverReport,
    SpeakingPayload, SubscribePayload, WelcomePayload, MAX_PACKET_SIZE,
};

use crate::metrics::{MetricsSnapshot, SfuMetrics};
use crate::router::{Outbound, PacketSink, Router};
use crate::session::SessionManager;

/// Default worker-pool size.
pub const DEFAULT_WORKERS: usize = 4;

/// Minimum kernel buffer size for media sockets.
pub const SOCKET_BUFFER_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum SfuError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid bind address: {0}")]
    BindAddr(String),
}

/// Tunables for one media-server process.
#[derive(Debug, Clone)]
pub struct SfuConfig {
    pub bind_host: String,
    /// First UDP port; 0 binds an ephemeral port.
    pub port_start: u16,
    /// Number of consecutive ports (one socket each).
    pub port_count: u16,
    pub workers: usize,
    pub worker_queue_depth: usize,
    pub send_queue_depth: usize,
    pub socket_buffer_bytes: usize,
    pub inactivity_timeout: Duration,
    pub sweep_interval: Duration,
    pub retransmit_ttl: Duration,
    pub shutdown_grace: Duration,
    /// This server's registry id; HELLO tokens must be pinned to it.
    pub server_id: Uuid,
    /// Shared secret the control plane signs voice tokens with.
    pub token_secret: String,
}

impl SfuConfig {
    pub fn new(server_id: Uuid, token_secret: impl Into<String>) -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            port_start: 0,
            port_count: 1,
            workers: DEFAULT_WORKERS,
            worker_queue_depth: 1024,
            send_queue_depth: 4096,
            socket_buffer_bytes: SOCKET_BUFFER_BYTES,
            inactivity_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(10),
            retransmit_ttl: Duration::from_millis(500),
            shutdown_grace: Duration::from_secs(5),
            server_id,
            token_secret: token_secret.into(),
        }
    }
}

/// One received datagram, queued toward the worker pool.
struct Job {
    socket: usize,
    data: Bytes,
    src: SocketAddr,
}

/// The UDP media server: socket lifecycle, worker pool, packet dispatch,
/// and the control-message handlers.
pub struct UdpServer {
    sockets: Vec<Arc<UdpSocket>>,
    local_addrs: Vec<SocketAddr>,
    sessions: Arc<SessionManager>,
    metrics: Arc<SfuMetrics>,
    router: Arc<Router>,
    sink: PacketSink,
    verifier: VoiceTokenVerifier,
    accepting: AtomicBool,
    closed: AtomicBool,
    shutdown: Notify,
    inactivity_timeout: Duration,
    sweep_interval: Duration,
    shutdown_grace: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Bind one UDP socket with enlarged kernel buffers, nonblocking, ready for
/// tokio.
fn bind_socket(addr: SocketAddr, buffer_bytes: usize) -> Result<UdpSocket, SfuError> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    let _ = socket.set_recv_buffer_size(buffer_bytes);
    let _ = socket.set_send_buffer_size(buffer_bytes);
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}

fn worker_for(src: SocketAddr, workers: usize) -> usize {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    src.hash(&mut hasher);
    (hasher.finish() as usize) % workers
}

impl UdpServer {
    /// Bind the sockets and spawn the read loops, worker pool, sender task
    /// and inactivity sweep.
    pub async fn start(config: SfuConfig) -> Result<Arc<Self>, SfuError> {
        let host: std::net::IpAddr = config
            .bind_host
            .parse()
            .map_err(|_| SfuError::BindAddr(config.bind_host.clone()))?;

        let mut sockets = Vec::new();
        let mut local_addrs = Vec::new();
        for i in 0..config.port_count.max(1) {
            let port = if config.port_start == 0 {
                0
            } else {
                config.port_start + i
            };
            let socket = bind_socket(SocketAddr::new(host, port), config.socket_buffer_bytes)?;
            local_addrs.push(socket.local_addr()?);
            sockets.push(Arc::new(socket));
        }

        let sessions = Arc::new(SessionManager::new(config.retransmit_ttl));
        let metrics = Arc::new(SfuMetrics::default());
        let (send_tx, send_rx) = mpsc::channel::<Outbound>(config.send_queue_depth);
        let sink = PacketSink::new(send_tx, metrics.clone());
        let router = Arc::new(Router::new(sessions.clone(), sink.clone(), metrics.clone()));

        let server = Arc::new(Self {
            sockets,
            local_addrs,
            sessions,
            metrics,
            router,
            sink,
            verifier: VoiceTokenVerifier::new(&config.token_secret, config.server_id),
            accepting: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
            inactivity_timeout: config.inactivity_timeout,
            sweep_interval: config.sweep_interval,
            shutdown_grace: config.shutdown_grace,
            tasks: Mutex::new(Vec::new()),
        });

        let workers = config.workers.max(1);
        let mut worker_txs = Vec::with_capacity(workers);
        for _ in 0..workers {
            let (tx, rx) = mpsc::channel::<Job>(config.worker_queue_depth);
            worker_txs.push(tx);
            server.spawn_worker(rx);
        }

        for (index, socket) in server.sockets.iter().enumerate() {
            server.spawn_read_loop(index, socket.clone(), worker_txs.clone());
        }
        server.spawn_sender(send_rx);
        server.spawn_sweep();

        info!(
            addrs = ?server.local_addrs,
            workers,
            "media server listening"
        );
        Ok(server)
    }

    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.session_count().await
    }

    pub async fn metrics_snapshot(&self) -> MetricsSnapshot {
        let sessions = self.sessions.session_count().await as u64;
        let rooms = self.sessions.room_count().await as u64;
        self.metrics.snapshot(sessions, rooms)
    }

    /// Stop accepting HELLOs, wait up to the grace period for sessions to
    /// drain, then force-close sockets and tasks.
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);

        let deadline = tokio::time::Instant::now() + self.shutdown_grace;
        while self.sessions.session_count().await > 0
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        self.closed.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();

        let tasks = {
            let mut guard = self.tasks.lock().unwrap();
            std::mem::take(&mut *guard)
        };
        for task in tasks {
            task.abort();
        }
        info!("media server stopped");
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.tasks.lock().unwrap().push(handle);
    }

    fn spawn_read_loop(
        self: &Arc<Self>,
        index: usize,
        socket: Arc<UdpSocket>,
        worker_txs: Vec<mpsc::Sender<Job>>,
    ) {
        let server = self.clone();
        let handle = tokio::spawn(async move {
            let workers = worker_txs.len();
            let mut buf = vec![0u8; MAX_PACKET_SIZE];
            loop {
                if server.closed.load(Ordering::SeqCst) {
                    break;
                }
                let received = tokio::select! {
                    result = socket.recv_from(&mut buf) => result,
                    _ = server.shutdown.notified() => break,
                };
                let (len, src) = match received {
                    Ok(pair) => pair,
                    Err(e) => {
                        if server.closed.load(Ordering::SeqCst) {
                            break;
                        }
                        debug!(socket = index, error = %e, "udp recv error");
                        continue;
                    }
                };
                if len == 0 {
                    continue;
                }
                server.metrics.record_received(len);

                let job = Job {
                    socket: index,
                    data: Bytes::copy_from_slice(&buf[..len]),
                    src,
                };
                // Same sender always lands on the same worker, so packets
                // from one client stay in order end to end.
                if worker_txs[worker_for(src, workers)].try_send(job).is_err() {
                    server.metrics.record_dropped();
                }
            }
            debug!(socket = index, "read loop exited");
        });
        self.track(handle);
    }

    fn spawn_worker(self: &Arc<Self>, rx: mpsc::Receiver<Job>) {
        let server = self.clone();
        let handle = tokio::spawn(async move {
            let rx = Arc::new(tokio::sync::Mutex::new(rx));
            loop {
                let loop_server = server.clone();
                let loop_rx = rx.clone();
                let worker = tokio::spawn(async move {
                    loop {
                        let job = { loop_rx.lock().await.recv().await };
                        match job {
                            Some(job) => loop_server.handle_packet(job).await,
                            None => break,
                        }
                    }
                });
                match worker.await {
                    Ok(()) => break,
                    Err(e) => {
                        // A panicking handler costs one packet, never the
                        // worker pool.
                        server.metrics.record_dropped();
                        warn!(error = %e, "worker crashed, respawning");
                    }
                }
            }
        });
        self.track(handle);
    }

    fn spawn_sender(self: &Arc<Self>, mut rx: mpsc::Receiver<Outbound>) {
        let server = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(out) = rx.recv().await {
                let Some(socket) = server.sockets.get(out.socket) else {
                    continue;
                };
                match socket.send_to(&out.bytes, out.addr).await {
                    Ok(sent) => server.metrics.record_sent(sent),
                    // Send errors never tear down a session.
                    Err(e) => debug!(addr = %out.addr, error = %e, "udp send failed"),
                }
            }
        });
        self.track(handle);
    }

    fn spawn_sweep(self: &Arc<Self>) {
        let server = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(server.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = server.shutdown.notified() => break,
                }
                if server.closed.load(Ordering::SeqCst) {
                    break;
                }
                let removed = server
                    .sessions
                    .cleanup_inactive(server.inactivity_timeout)
                    .await;
                for session in removed {
                    info!(
                        session_id = session.session_id,
                        user_id = session.user_id,
                        room_id = session.room_id,
                        "session timed out"
                    );
                    server.router.broadcast_participant_left(&session).await;
                }
            }
        });
        self.track(handle);
    }

    async fn handle_packet(&self, job: Job) {
        let Some(&type_byte) = job.data.first() else {
            self.metrics.record_dropped();
            return;
        };
        let Ok(packet_type) = PacketType::try_from(type_byte) else {
            self.metrics.record_dropped();
            return;
        };

        match packet_type {
            PacketType::Hello => self.handle_hello(job).await,
            PacketType::Audio | PacketType::Video => {
                self.router.route_media(job.data, job.src, job.socket).await;
            }
            PacketType::Ping => self.handle_ping(job).await,
            PacketType::Bye => self.handle_bye(job).await,
            PacketType::Speaking => self.handle_speaking(job).await,
            PacketType::MediaState => self.handle_media_state(job).await,
            PacketType::Nack => self.handle_nack(job).await,
            PacketType::Pli => self.handle_pli(job).await,
            PacketType::ReceiverReport => self.handle_rr(job).await,
            PacketType::Subscribe => self.handle_subscribe(job).await,
            // Server-origin types arriving from the network are bogus.
            PacketType::Welcome | PacketType::Pong | PacketType::ParticipantLeft => {
                self.metrics.record_dropped();
            }
        }
    }

    /// HELLO: verify the token, evict any prior session for the same
    /// (user, room), install the AEAD, reply WELCOME, announce the join.
    /// Every failure path is silent.
    async fn handle_hello(&self, job: Job) {
        if !self.accepting.load(Ordering::SeqCst) {
            self.metrics.record_dropped();
            return;
        }

        let hello: HelloPayload = match control::decode_json(&job.data[1..]) {
            Ok(h) => h,
            Err(_) => {
                self.metrics.record_dropped();
                return;
            }
        };

        let claims = match self.verifier.verify(&hello.token) {
            Ok(c) => c,
            Err(e) => {
                debug!(src = %job.src, error = %e, "hello token rejected");
                self.metrics.record_dropped();
                return;
            }
        };

        let suite = match CryptoSuite::from_params(&hello.crypto) {
            Ok(s) => s,
            Err(e) => {
                debug!(src = %job.src, error = %e, "hello crypto block rejected");
                self.metrics.record_dropped();
                return;
            }
        };

        let (session, evicted) = self
            .sessions
            .create(
                claims.user_id,
                claims.room_id,
                job.src,
                job.socket,
                &suite,
                hello.video_enabled,
            )
            .await;

        if let Some(old) = evicted {
            info!(
                user_id = old.user_id,
                room_id = old.room_id,
                old_session = old.session_id,
                new_session = session.session_id,
                "session replaced by newer hello"
            );
            self.router.broadcast_participant_left(&old).await;
        }

        let participants = self
            .sessions
            .room_sessions(session.room_id)
            .await
            .into_iter()
            .filter(|s| s.session_id != session.session_id)
            .map(|s| s.participant_info())
            .collect();

        let welcome = WelcomePayload {
            session_id: session.session_id,
            audio_ssrc: session.audio_ssrc,
            video_ssrc: session.video_ssrc,
            screen_ssrc: session.screen_ssrc,
            participants,
        };
        if let Ok(bytes) = control::encode_json(PacketType::Welcome, &welcome) {
            self.sink.send(job.socket, job.src, bytes);
        }

        self.router.broadcast_media_state(&session).await;

        info!(
            user_id = session.user_id,
            room_id = session.room_id,
            session_id = session.session_id,
            audio_ssrc = session.audio_ssrc,
            "session joined"
        );
    }

    /// PING: touch the sender and echo the datagram back as PONG,
    /// preserving everything after the type byte. Unknown sources get
    /// nothing.
    async fn handle_ping(&self, job: Job) {
        let Some(session) = self.sessions.by_addr(job.src).await else {
            self.metrics.record_dropped();
            return;
        };
        session.touch();

        let mut pong = BytesMut::with_capacity(job.data.len());
        pong.extend_from_slice(&job.data);
        pong[0] = PacketType::Pong as u8;
        self.sink.send(job.socket, job.src, pong.freeze());
    }

    async fn handle_bye(&self, job: Job) {
        let Ok(bye) = Bye::decode(&job.data[1..]) else {
            self.metrics.record_dropped();
            return;
        };
        let Some(session) = self.sessions.by_ssrc(bye.ssrc).await else {
            self.metrics.record_dropped();
            return;
        };
        if let Some(removed) = self.sessions.remove(session.session_id).await {
            info!(
                session_id = removed.session_id,
                user_id = removed.user_id,
                room_id = removed.room_id,
                "session left"
            );
            self.router.broadcast_participant_left(&removed).await;
        }
    }

    async fn handle_speaking(&self, job: Job) {
        let Ok(payload) = control::decode_json::<SpeakingPayload>(&job.data[1..]) else {
            self.metrics.record_dropped();
            return;
        };
        let Some(session) = self.sessions.by_addr(job.src).await else {
            self.metrics.record_dropped();
            return;
        };
        if !session.owns_ssrc(payload.ssrc) {
            self.metrics.record_dropped();
            return;
        }
        session.set_speaking(payload.speaking);
        self.router
            .broadcast(session.room_id, session.session_id, job.data)
            .await;
    }

    async fn handle_media_state(&self, job: Job) {
        let Ok(update) = control::decode_json::<MediaStateUpdate>(&job.data[1..]) else {
            self.metrics.record_dropped();
            return;
        };
        let Some(session) = self.sessions.by_addr(job.src).await else {
            self.metrics.record_dropped();
            return;
        };
        session.set_media_flags(update.muted, update.video_enabled, update.screen_sharing);
        self.router.broadcast_media_state(&session).await;
    }

    async fn handle_nack(&self, job: Job) {
        let Ok(nack) = Nack::decode(&job.data[1..]) else {
            self.metrics.record_dropped();
            return;
        };
        if let Some(requester) = self.sessions.by_addr(job.src).await {
            requester.touch();
        }
        self.router.relay_nack(&nack, job.src, job.socket).await;
    }

    async fn handle_pli(&self, job: Job) {
        let Ok(pli) = Pli::decode(&job.data[1..]) else {
            self.metrics.record_dropped();
            return;
        };
        if let Some(requester) = self.sessions.by_addr(job.src).await {
            requester.touch();
        }
        self.router.relay_to_ssrc(pli.ssrc, job.data).await;
    }

    async fn handle_rr(&self, job: Job) {
        let Ok(report) = ReceiverReport::decode(&job.data[1..]) else {
            self.metrics.record_dropped();
            return;
        };
        if let Some(reporter) = self.sessions.by_addr(job.src).await {
            reporter.touch();
        }
        self.router.relay_to_ssrc(report.ssrc, job.data).await;
    }

    async fn handle_subscribe(&self, job: Job) {
        let Ok(payload) = control::decode_json::<SubscribePayload>(&job.data[1..]) else {
            self.metrics.record_dropped();
            return;
        };
        let Some(session) = self.sessions.by_addr(job.src).await else {
            self.metrics.record_dropped();
            return;
        };
        session.set_subscriptions(payload.ssrcs);
    }
}
