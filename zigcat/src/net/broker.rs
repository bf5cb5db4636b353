use crate::config::Config;
use crate::net::access::{AccessList, DenialBackoff, Verdict};
use crate::net::chat::{self, NicknameRegistry, NicknameRejection};
use crate::net::flow::FlowManager;
use crate::net::pool::{BufferPool, PoolChunk};
use crate::net::stream::{Connection, Listener};
use crate::net::telnet::TelnetSession;
use crate::shared::{ErrorKind, RelayError, RelayResult};
use crate::shutdown;
use indexmap::IndexMap;
use mio::{Events, Interest, Poll, Token};
use std::cmp::min;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::rc::Rc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use wick::logging::{self, Logger};

const LISTENER: Token = Token(0);

/// Fixed per-client inbound buffer.
const READ_BUF_SIZE: usize = 4096;

/// Floor of the maintenance cadence regardless of poll timeouts.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(3);

/// Free pool slots idle past this are reclaimed during maintenance.
const POOL_IDLE_RECLAIM: Duration = Duration::from_secs(60);

/// Per-client relay budget window and limits.
const FLOW_WINDOW: Duration = Duration::from_secs(1);
const FLOW_BYTES_PER_WINDOW: usize = 256 * 1024;
const FLOW_MAX_PENDING: usize = 256 * 1024;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BrokerMode {
    /// Raw fan-out: every byte from one client goes to all others.
    Relay,
    /// Line-oriented chat with the nickname protocol.
    Chat,
}

/// One queued outbound span. Chunks are shared across receivers; `pos` is
/// this client's private drain cursor.
struct OutSegment {
    chunk: Rc<PoolChunk>,
    pos: usize,
}

struct Client {
    id: u64,
    conn: Connection,
    nickname: Option<String>,
    read_buf: Box<[u8; READ_BUF_SIZE]>,
    read_len: usize,
    out: VecDeque<OutSegment>,
    pending_out: usize,
    writable_armed: bool,
    last_activity: Instant,
    connect_time: Instant,
    bytes_sent: u64,
    bytes_received: u64,
    nickname_attempts: u8,
    telnet: Option<TelnetSession>,
    lines_this_tick: usize,
    defer_lines: bool,
    failed: bool,
}

impl Client {
    fn token(&self) -> Token {
        Token(self.id as usize + 1)
    }
}

enum ReadStep {
    Progress,
    WouldBlock,
    Eof,
    BufferFull,
    Failed(RelayError),
}

/// Single-threaded multi-client relay. One `Poll` multiplexes the listener
/// and every client; all state is owned by the loop thread.
pub struct Broker {
    mode: BrokerMode,
    listener: Listener,
    poll: Poll,
    events: Events,
    clients: IndexMap<u64, Client>,
    names: NicknameRegistry,
    pool: Arc<BufferPool>,
    flow: FlowManager,
    access: AccessList,
    backoff: DenialBackoff,
    next_id: u64,
    max_clients: usize,
    idle_timeout: Option<Duration>,
    nickname_max: usize,
    message_max: usize,
    telnet_enabled: bool,
    last_maintenance: Instant,
    started_ts: u64,
    running: bool,
    relayed_bytes: u64,
    event_scratch: Vec<(Token, bool, bool, bool)>,
    id_scratch: Vec<u64>,
    read_scratch: Box<[u8; READ_BUF_SIZE]>,
    log: Logger,
}

impl Broker {
    pub fn new(
        mut listener: Listener,
        mode: BrokerMode,
        config: &Config,
        access: AccessList,
        pool: Arc<BufferPool>,
        log: &Logger,
    ) -> RelayResult<Broker> {
        let poll = Poll::new().map_err(RelayError::from)?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .map_err(RelayError::from)?;

        let now = Instant::now();
        let log = log.new(logging::o!("component" => "broker"));

        logging::info!(log, "broker listening";
                       "endpoint" => listener.describe(),
                       "mode" => ?mode,
                       "max_clients" => config.max_clients);

        Ok(Broker {
            mode,
            listener,
            poll,
            events: Events::with_capacity(1024),
            clients: IndexMap::new(),
            names: NicknameRegistry::new(),
            pool,
            flow: FlowManager::new(FLOW_WINDOW, FLOW_BYTES_PER_WINDOW, FLOW_MAX_PENDING),
            access,
            backoff: DenialBackoff::default_policy(),
            next_id: 0,
            max_clients: config.max_clients,
            idle_timeout: config.idle_timeout(),
            nickname_max: config.chat_max_nickname_len,
            message_max: config.chat_max_message_len,
            telnet_enabled: config.telnet,
            last_maintenance: now,
            started_ts: wick::time::timestamp_secs(),
            running: true,
            relayed_bytes: 0,
            event_scratch: Vec::with_capacity(1024),
            id_scratch: Vec::new(),
            read_scratch: Box::new([0u8; READ_BUF_SIZE]),
            log,
        })
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Runs until shutdown is requested or the loop stops itself.
    pub fn run(&mut self) -> RelayResult<()> {
        while self.running && !shutdown::requested() {
            self.turn(None)?;
        }
        self.finish();
        Ok(())
    }

    fn poll_timeout(&self) -> Duration {
        let mut timeout = match self.idle_timeout {
            Some(idle) => min(idle / 2, Duration::from_millis(1000)),
            None => Duration::from_millis(1000),
        };
        if let Some(cap) = self.flow.level().poll_cap() {
            timeout = min(timeout, cap);
        }
        // Deferred chat lines want an immediate follow-up tick.
        if self.clients.values().any(|client| client.defer_lines) {
            timeout = Duration::from_millis(0);
        }
        timeout
    }

    /// One event-loop iteration. Public so tests can drive the loop by hand.
    pub fn turn(&mut self, timeout_override: Option<Duration>) -> RelayResult<()> {
        let timeout = timeout_override.unwrap_or_else(|| self.poll_timeout());
        let now = Instant::now();

        for client in self.clients.values_mut() {
            client.lines_this_tick = 0;
        }

        if let Err(err) = self.poll.poll(&mut self.events, Some(timeout)) {
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err.into());
        }

        self.event_scratch.clear();
        let mut accept_ready = false;
        for event in self.events.iter() {
            if event.token() == LISTENER {
                accept_ready = true;
            } else {
                self.event_scratch.push((
                    event.token(),
                    event.is_readable() || event.is_read_closed(),
                    event.is_writable(),
                    event.is_error(),
                ));
            }
        }
        let had_events = accept_ready || !self.event_scratch.is_empty();

        if accept_ready {
            self.accept_clients(now);
        }

        let staged = std::mem::replace(&mut self.event_scratch, Vec::new());
        for &(token, readable, writable, errored) in &staged {
            let id = token.0 as u64 - 1;
            if errored {
                self.remove_client(id, "socket error", true, now);
                continue;
            }
            if readable {
                self.service_read(id, now);
            }
            if writable {
                self.service_write(id, now);
            }
        }
        self.event_scratch = staged;

        self.process_deferred_lines(now);

        if !had_events || now.duration_since(self.last_maintenance) >= MAINTENANCE_INTERVAL {
            self.maintenance(now);
        }

        Ok(())
    }

    fn accept_clients(&mut self, now: Instant) {
        loop {
            match self.listener.accept() {
                Ok((conn, peer_ip)) => {
                    if let Some(ip) = peer_ip {
                        if self.access.evaluate(ip) == Verdict::Denied {
                            logging::info!(self.log, "connection denied"; "peer" => %ip);
                            drop(conn);
                            if let Some(sleep) = self.backoff.on_denied() {
                                logging::warn!(self.log, "denial backoff engaged";
                                               "consecutive" => self.backoff.consecutive(),
                                               "sleep_ms" => sleep.as_millis() as u64);
                                thread::sleep(sleep);
                            }
                            continue;
                        }
                    }
                    self.backoff.on_allowed();

                    if self.clients.len() >= self.max_clients {
                        logging::warn!(self.log, "client limit reached, rejecting";
                                       "peer" => conn.peer_describe(),
                                       "max_clients" => self.max_clients);
                        drop(conn);
                        continue;
                    }

                    self.admit_client(conn, now);
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    logging::error!(self.log, "accept failed"; "error" => %err);
                    break;
                }
            }
        }
    }

    fn admit_client(&mut self, mut conn: Connection, now: Instant) {
        let id = self.next_id;
        self.next_id += 1;
        let token = Token(id as usize + 1);

        if let Err(err) = self
            .poll
            .registry()
            .register(&mut conn, token, Interest::READABLE)
        {
            logging::error!(self.log, "client registration failed"; "error" => %err);
            return;
        }

        logging::debug!(self.log, "client connected";
                        "client_id" => id,
                        "peer" => conn.peer_describe());

        let telnet = if self.telnet_enabled {
            Some(TelnetSession::new(&self.log))
        } else {
            None
        };

        let client = Client {
            id,
            conn,
            nickname: None,
            read_buf: Box::new([0u8; READ_BUF_SIZE]),
            read_len: 0,
            out: VecDeque::new(),
            pending_out: 0,
            writable_armed: false,
            last_activity: now,
            connect_time: now,
            bytes_sent: 0,
            bytes_received: 0,
            nickname_attempts: 0,
            telnet,
            lines_this_tick: 0,
            defer_lines: false,
            failed: false,
        };

        self.flow.register_client(id, now);
        self.clients.insert(id, client);

        let mut greeting = Vec::new();
        if self.telnet_enabled {
            if let Some(client) = self.clients.get_mut(&id) {
                if let Some(session) = client.telnet.as_mut() {
                    session.initial_negotiation(&mut greeting);
                }
            }
        }
        if self.mode == BrokerMode::Chat {
            greeting.extend_from_slice(chat::WELCOME);
        }
        if !greeting.is_empty() {
            self.queue_to_client(id, &greeting, now);
        }
    }

    /// Drains one client's socket. In relay mode each chunk fans out
    /// immediately; in chat mode buffered lines are handed to the line
    /// processor under the per-tick budget.
    fn service_read(&mut self, id: u64, now: Instant) {
        loop {
            let step = self.read_chunk(id, now);
            match step {
                ReadStep::Progress => match self.mode {
                    BrokerMode::Relay => self.relay_read_buffer(id, now),
                    BrokerMode::Chat => {
                        self.process_lines(id, now);
                        if self
                            .clients
                            .get(&id)
                            .map_or(false, |client| client.defer_lines)
                        {
                            // Budget exhausted; leave the rest buffered.
                            break;
                        }
                    }
                },
                ReadStep::BufferFull => match self.mode {
                    BrokerMode::Relay => self.relay_read_buffer(id, now),
                    BrokerMode::Chat => {
                        self.process_lines(id, now);
                        let still_full = self
                            .clients
                            .get(&id)
                            .map_or(false, |client| client.read_len == READ_BUF_SIZE);
                        if still_full {
                            let deferred = self
                                .clients
                                .get(&id)
                                .map_or(false, |client| client.defer_lines);
                            if !deferred {
                                // A full buffer with no newline is hopeless.
                                self.queue_to_client(id, chat::LINE_OVERFLOW_NOTICE, now);
                                self.remove_client(id, "line buffer overflow", true, now);
                            }
                            break;
                        }
                    }
                },
                ReadStep::WouldBlock => break,
                ReadStep::Eof => {
                    self.remove_client(id, "peer closed", true, now);
                    break;
                }
                ReadStep::Failed(err) => {
                    logging::debug!(self.log, "client read failed";
                                    "client_id" => id, "error" => ?err);
                    self.remove_client(id, "read error", true, now);
                    break;
                }
            }
            if !self.clients.contains_key(&id) {
                break;
            }
        }
    }

    /// Reads one chunk into the client's fixed buffer, running the telnet
    /// decoder when enabled.
    fn read_chunk(&mut self, id: u64, now: Instant) -> ReadStep {
        let read_scratch = &mut self.read_scratch;
        let client = match self.clients.get_mut(&id) {
            Some(client) => client,
            None => return ReadStep::WouldBlock,
        };

        if client.read_len == READ_BUF_SIZE {
            return ReadStep::BufferFull;
        }

        let space = READ_BUF_SIZE - client.read_len;
        let n = match client.conn.read(&mut read_scratch[..space]) {
            Ok(0) => return ReadStep::Eof,
            Ok(n) => n,
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                return ReadStep::WouldBlock
            }
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {
                return ReadStep::Progress
            }
            Err(err) => return ReadStep::Failed(err.into()),
        };

        client.bytes_received += n as u64;
        client.last_activity = now;

        let mut wire_replies = Vec::new();
        if let Some(session) = client.telnet.as_mut() {
            let mut app = Vec::with_capacity(n);
            if let Err(err) = session.decode(&read_scratch[..n], &mut app, &mut wire_replies) {
                return ReadStep::Failed(err);
            }
            let take = app.len();
            client.read_buf[client.read_len..client.read_len + take].copy_from_slice(&app);
            client.read_len += take;
        } else {
            client.read_buf[client.read_len..client.read_len + n]
                .copy_from_slice(&read_scratch[..n]);
            client.read_len += n;
        }

        if !wire_replies.is_empty() {
            self.queue_to_client(id, &wire_replies, now);
        }

        ReadStep::Progress
    }

    /// Relay mode: fan the client's buffered bytes out to everyone else.
    fn relay_read_buffer(&mut self, id: u64, now: Instant) {
        let len = match self.clients.get_mut(&id) {
            Some(client) => {
                let len = client.read_len;
                self.read_scratch[..len].copy_from_slice(&client.read_buf[..len]);
                client.read_len = 0;
                len
            }
            None => return,
        };
        if len == 0 {
            return;
        }
        self.relayed_bytes += len as u64;
        self.fanout_scratch(len, Some(id), true, now);
    }

    /// Fans `self.read_scratch[..len]` out to every client except `exclude`.
    /// Chunks are staged once and shared by reference across receivers.
    fn fanout_scratch(&mut self, len: usize, exclude: Option<u64>, gate_flow: bool, now: Instant) {
        let Broker {
            clients,
            pool,
            flow,
            poll,
            read_scratch,
            log,
            ..
        } = self;

        let data = &read_scratch[..len];
        let mut chunks: Vec<Rc<PoolChunk>> = Vec::new();
        let mut offset = 0;
        while offset < len {
            match pool.acquire(now) {
                Ok(mut chunk) => {
                    offset += chunk.push(&data[offset..]);
                    chunks.push(Rc::new(chunk));
                }
                Err(err) => {
                    logging::warn!(log, "relay staging refused, dropping remainder";
                                   "error" => ?err,
                                   "dropped" => len - offset);
                    break;
                }
            }
        }
        if chunks.is_empty() {
            return;
        }

        let registry = poll.registry();
        for (&cid, client) in clients.iter_mut() {
            if Some(cid) == exclude {
                continue;
            }
            for chunk in &chunks {
                if gate_flow && !flow.should_send(cid, chunk.len(), now) {
                    continue;
                }
                client.out.push_back(OutSegment {
                    chunk: Rc::clone(chunk),
                    pos: 0,
                });
                client.pending_out += chunk.len();
                flow.record_queued(cid, chunk.len());
            }
            if Self::drain_client(client, registry, flow, pool, log, now).is_err() {
                client.failed = true;
            }
        }

        // Chunks nobody accepted go straight back to the pool.
        for chunk in chunks {
            if let Ok(storage) = Rc::try_unwrap(chunk) {
                pool.release(storage, now);
            }
        }

        self.sweep_failed(now);
    }

    /// Queues bytes for a single client and attempts an immediate drain.
    /// System messages bypass the flow gate.
    fn queue_to_client(&mut self, id: u64, data: &[u8], now: Instant) {
        let Broker {
            clients,
            pool,
            flow,
            poll,
            log,
            ..
        } = self;

        let client = match clients.get_mut(&id) {
            Some(client) => client,
            None => return,
        };

        let mut offset = 0;
        while offset < data.len() {
            match pool.acquire(now) {
                Ok(mut chunk) => {
                    offset += chunk.push(&data[offset..]);
                    client.pending_out += chunk.len();
                    flow.record_queued(id, chunk.len());
                    client.out.push_back(OutSegment {
                        chunk: Rc::new(chunk),
                        pos: 0,
                    });
                }
                Err(err) => {
                    logging::warn!(log, "client send buffering refused";
                                   "client_id" => id, "error" => ?err);
                    client.failed = true;
                    break;
                }
            }
        }

        if Self::drain_client(client, poll.registry(), flow, pool, log, now).is_err() {
            client.failed = true;
        }

        self.sweep_failed(now);
    }

    /// Non-blocking drain of one client's write queue. Arms WRITABLE interest
    /// while data remains, disarms it on a full drain.
    fn drain_client(
        client: &mut Client,
        registry: &mio::Registry,
        flow: &mut FlowManager,
        pool: &BufferPool,
        log: &Logger,
        now: Instant,
    ) -> RelayResult<()> {
        while let Some(front) = client.out.front_mut() {
            let span = &front.chunk.bytes()[front.pos..];
            match client.conn.write(span) {
                Ok(0) => return Err(RelayError::Fatal(ErrorKind::PeerClosed)),
                Ok(n) => {
                    front.pos += n;
                    client.pending_out -= n;
                    client.bytes_sent += n as u64;
                    flow.record_sent(client.id, n);
                    if front.pos == front.chunk.len() {
                        let segment = client.out.pop_front().expect("Queue front vanished");
                        if let Ok(storage) = Rc::try_unwrap(segment.chunk) {
                            pool.release(storage, now);
                        }
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if !client.writable_armed {
                        let token = client.token();
                        registry
                            .reregister(
                                &mut client.conn,
                                token,
                                Interest::READABLE | Interest::WRITABLE,
                            )
                            .map_err(RelayError::from)?;
                        client.writable_armed = true;
                    }
                    return Ok(());
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    logging::debug!(log, "client write failed";
                                    "client_id" => client.id, "error" => %err);
                    return Err(err.into());
                }
            }
        }

        if client.writable_armed {
            let token = client.token();
            registry
                .reregister(&mut client.conn, token, Interest::READABLE)
                .map_err(RelayError::from)?;
            client.writable_armed = false;
        }
        Ok(())
    }

    fn service_write(&mut self, id: u64, now: Instant) {
        let Broker {
            clients,
            pool,
            flow,
            poll,
            log,
            ..
        } = self;

        if let Some(client) = clients.get_mut(&id) {
            if Self::drain_client(client, poll.registry(), flow, pool, log, now).is_err() {
                client.failed = true;
            }
        }
        self.sweep_failed(now);
    }

    /// Chat mode: pull complete lines off the client's buffer, bounded by the
    /// per-tick budget; the remainder is deferred to the next tick.
    fn process_lines(&mut self, id: u64, now: Instant) {
        loop {
            let line = {
                let client = match self.clients.get_mut(&id) {
                    Some(client) => client,
                    None => return,
                };
                if client.lines_this_tick >= chat::MAX_LINES_PER_TICK {
                    client.defer_lines = client.read_len > 0;
                    return;
                }
                match chat::extract_line(&mut client.read_buf[..], &mut client.read_len) {
                    Some(line) => {
                        client.lines_this_tick += 1;
                        line
                    }
                    None => {
                        client.defer_lines = false;
                        return;
                    }
                }
            };

            self.handle_line(id, line, now);
        }
    }

    fn process_deferred_lines(&mut self, now: Instant) {
        self.id_scratch.clear();
        for (&id, client) in self.clients.iter() {
            if client.defer_lines {
                self.id_scratch.push(id);
            }
        }
        let deferred = std::mem::replace(&mut self.id_scratch, Vec::new());
        for &id in &deferred {
            self.process_lines(id, now);
            // Freed buffer space may unblock a stalled socket read.
            if self
                .clients
                .get(&id)
                .map_or(false, |client| !client.defer_lines)
            {
                self.service_read(id, now);
            }
        }
        self.id_scratch = deferred;
    }

    fn handle_line(&mut self, id: u64, line: Vec<u8>, now: Instant) {
        let nickname = self
            .clients
            .get(&id)
            .and_then(|client| client.nickname.clone());

        match nickname {
            None => self.handle_nickname_attempt(id, &line, now),
            Some(nick) => {
                if let Some(rest) = line.strip_prefix(b"/nick ") {
                    self.handle_rename(id, &nick, &rest.to_vec(), now);
                } else {
                    self.handle_chat_message(id, &nick, &line, now);
                }
            }
        }
    }

    fn handle_nickname_attempt(&mut self, id: u64, line: &[u8], now: Instant) {
        let verdict = chat::validate_nickname(line, self.nickname_max)
            .map(|name| name.to_owned())
            .and_then(|name| {
                self.names.claim(&name, id)?;
                Ok(name)
            });

        match verdict {
            Ok(name) => {
                if let Some(client) = self.clients.get_mut(&id) {
                    client.nickname = Some(name.clone());
                    client.nickname_attempts = 0;
                }
                logging::info!(self.log, "nickname registered";
                               "client_id" => id, "nickname" => name.as_str());

                self.queue_to_client(id, &chat::msg_known_as(&name), now);
                self.broadcast(&chat::msg_joined(&name), Some(id), now);
            }
            Err(rejection) => self.fail_nickname_attempt(id, rejection, now),
        }
    }

    fn handle_rename(&mut self, id: u64, old: &str, candidate: &[u8], now: Instant) {
        let verdict = chat::validate_nickname(candidate, self.nickname_max)
            .map(|name| name.to_owned())
            .and_then(|name| {
                self.names.rename(old, &name, id)?;
                Ok(name)
            });

        match verdict {
            Ok(new) => {
                if let Some(client) = self.clients.get_mut(&id) {
                    client.nickname = Some(new.clone());
                    client.nickname_attempts = 0;
                }
                logging::info!(self.log, "nickname changed";
                               "client_id" => id, "old" => old, "new" => new.as_str());
                // The renamer sees the announcement too.
                self.broadcast(&chat::msg_renamed(old, &new), None, now);
            }
            Err(rejection) => self.fail_nickname_attempt(id, rejection, now),
        }
    }

    fn fail_nickname_attempt(&mut self, id: u64, rejection: NicknameRejection, now: Instant) {
        let attempts = match self.clients.get_mut(&id) {
            Some(client) => {
                client.nickname_attempts = client.nickname_attempts.saturating_add(1);
                client.nickname_attempts
            }
            None => return,
        };

        logging::debug!(self.log, "nickname rejected";
                        "client_id" => id,
                        "reason" => rejection.reason(),
                        "attempts" => attempts);

        let mut reply = chat::msg_rejection(rejection);
        if attempts >= chat::MAX_NICKNAME_ATTEMPTS {
            reply.extend_from_slice(chat::TOO_MANY_ATTEMPTS_NOTICE);
            self.queue_to_client(id, &reply, now);
            self.remove_client(id, "too many failed nickname attempts", true, now);
        } else {
            reply.extend_from_slice(chat::NICK_REPROMPT);
            self.queue_to_client(id, &reply, now);
        }
    }

    fn handle_chat_message(&mut self, id: u64, nick: &str, line: &[u8], now: Instant) {
        if line.is_empty() {
            return;
        }
        if line.len() > self.message_max {
            self.queue_to_client(id, &chat::msg_too_long(self.message_max), now);
            return;
        }
        self.relayed_bytes += line.len() as u64;
        self.broadcast(&chat::msg_chat(nick, line), Some(id), now);
    }

    /// Stages `data` through the scratch buffer and fans it out. Broadcasts
    /// are system traffic and bypass the flow gate.
    fn broadcast(&mut self, data: &[u8], exclude: Option<u64>, now: Instant) {
        let mut offset = 0;
        while offset < data.len() {
            let n = min(READ_BUF_SIZE, data.len() - offset);
            self.read_scratch[..n].copy_from_slice(&data[offset..offset + n]);
            self.fanout_scratch(n, exclude, false, now);
            offset += n;
        }
    }

    fn sweep_failed(&mut self, now: Instant) {
        self.id_scratch.clear();
        for (&id, client) in self.clients.iter() {
            if client.failed {
                self.id_scratch.push(id);
            }
        }
        let failed = std::mem::replace(&mut self.id_scratch, Vec::new());
        for &id in &failed {
            self.remove_client(id, "write failure", true, now);
        }
        self.id_scratch = failed;
    }

    fn remove_client(&mut self, id: u64, reason: &str, notify_chat: bool, now: Instant) {
        // The socket is deregistered and shut down before its id leaves the
        // bookkeeping so a recycled descriptor can never be confused with
        // this client.
        match self.clients.get_mut(&id) {
            Some(client) => {
                let _ = self.poll.registry().deregister(&mut client.conn);
                let _ = client.conn.shutdown(Shutdown::Both);
            }
            None => return,
        }
        let mut client = self
            .clients
            .shift_remove(&id)
            .expect("Client vanished during removal");

        for segment in client.out.drain(..) {
            if let Ok(storage) = Rc::try_unwrap(segment.chunk) {
                self.pool.release(storage, now);
            }
        }
        self.flow.remove_client(id);

        logging::info!(self.log, "client disconnected";
                       "client_id" => id,
                       "reason" => reason,
                       "bytes_sent" => client.bytes_sent,
                       "bytes_received" => client.bytes_received,
                       "undelivered" => client.pending_out,
                       "connected_secs" => now.duration_since(client.connect_time).as_secs());

        if let Some(nick) = client.nickname.take() {
            self.names.release(&nick);
            drop(client);
            if notify_chat && self.mode == BrokerMode::Chat {
                self.broadcast(&chat::msg_left(&nick), None, now);
            }
        }
    }

    /// Timeout-path housekeeping: idle sweep, health check, stats, pool
    /// reclaim.
    fn maintenance(&mut self, now: Instant) {
        self.last_maintenance = now;

        if let Some(idle) = self.idle_timeout {
            self.id_scratch.clear();
            for (&id, client) in self.clients.iter() {
                if now.duration_since(client.last_activity) > idle {
                    self.id_scratch.push(id);
                }
            }
            let idle_ids = std::mem::replace(&mut self.id_scratch, Vec::new());
            for &id in &idle_ids {
                self.remove_client(id, "idle timeout", true, now);
            }
            self.id_scratch = idle_ids;
        }

        // Health check: no allocation while walking, removal afterwards.
        for client in self.clients.values_mut() {
            if let Ok(Some(_err)) = client.conn.take_error() {
                client.failed = true;
            }
        }
        self.sweep_failed(now);

        let reclaimed = self.pool.cleanup(POOL_IDLE_RECLAIM, now);
        if reclaimed > 0 {
            logging::debug!(self.log, "pool reclaimed idle slots"; "count" => reclaimed);
        }
        self.flow.update_level(self.pool.usage_fraction());

        let stats = self.pool.stats();
        logging::debug!(self.log, "broker stats";
                        "clients" => self.clients.len(),
                        "nicknames" => self.names.len(),
                        "relayed_bytes" => self.relayed_bytes,
                        "pool_in_use" => stats.in_use,
                        "flow_level" => ?self.flow.level(),
                        "uptime_secs" => wick::time::timestamp_secs().saturating_sub(self.started_ts));
    }

    /// Graceful shutdown: chat clients get a notice and one drain attempt,
    /// then everything is torn down.
    fn finish(&mut self) {
        let now = Instant::now();
        logging::info!(self.log, "broker shutting down"; "clients" => self.clients.len());

        if self.mode == BrokerMode::Chat && !self.clients.is_empty() {
            self.broadcast(chat::SHUTDOWN_NOTICE, None, now);
        }

        self.id_scratch.clear();
        for &id in self.clients.keys() {
            self.id_scratch.push(id);
        }
        let ids = std::mem::replace(&mut self.id_scratch, Vec::new());
        for &id in &ids {
            self.remove_client(id, "server shutdown", false, now);
        }
        self.id_scratch = ids;
        self.running = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::pool::CHUNK_CAPACITY;
    use std::io::{ErrorKind, Read as _, Write as _};
    use std::net::{SocketAddr, TcpStream as StdTcpStream};

    fn test_config() -> Config {
        let mut config = Config::default();
        config.max_clients = 8;
        config.chat_max_nickname_len = 16;
        config.chat_max_message_len = 64;
        config
    }

    fn test_broker(mode: BrokerMode, config: &Config) -> (Broker, SocketAddr) {
        let listener = Listener::bind_tcp("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = match &listener {
            Listener::Tcp(l) => l.local_addr().unwrap(),
            #[cfg(unix)]
            _ => unreachable!(),
        };
        let pool = Arc::new(BufferPool::new(64 * CHUNK_CAPACITY, 1.0));
        let broker = Broker::new(
            listener,
            mode,
            config,
            AccessList::new(),
            pool,
            &logging::discard(),
        )
        .unwrap();
        (broker, addr)
    }

    fn pump(broker: &mut Broker, turns: usize) {
        for _ in 0..turns {
            broker
                .turn(Some(Duration::from_millis(20)))
                .expect("broker turn failed");
        }
    }

    fn connect(broker: &mut Broker, addr: SocketAddr) -> StdTcpStream {
        let stream = StdTcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_millis(100)))
            .unwrap();
        let before = broker.client_count();
        for _ in 0..50 {
            pump(broker, 1);
            if broker.client_count() > before {
                break;
            }
        }
        assert!(broker.client_count() > before, "client was not accepted");
        stream
    }

    /// Reads from `stream` (pumping the broker between attempts) until
    /// `want` bytes arrived or the deadline passes.
    fn read_exactly(broker: &mut Broker, stream: &mut StdTcpStream, want: usize) -> Vec<u8> {
        let mut collected = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut chunk = [0u8; 1024];
        while collected.len() < want {
            pump(broker, 1);
            match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => collected.extend_from_slice(&chunk[..n]),
                Err(ref err)
                    if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut => {}
                Err(err) => panic!("read failed: {}", err),
            }
            if Instant::now() > deadline {
                panic!(
                    "timed out; wanted {} bytes, got {:?}",
                    want,
                    String::from_utf8_lossy(&collected)
                );
            }
        }
        collected
    }

    fn expect_nothing(broker: &mut Broker, stream: &mut StdTcpStream) {
        pump(broker, 3);
        let mut chunk = [0u8; 64];
        match stream.read(&mut chunk) {
            Ok(n) => assert_eq!(n, 0, "unexpected data: {:?}", &chunk[..n]),
            Err(ref err)
                if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut => {}
            Err(err) => panic!("read failed: {}", err),
        }
    }

    #[test]
    fn test_relay_fans_out_to_all_but_sender() {
        let config = test_config();
        let (mut broker, addr) = test_broker(BrokerMode::Relay, &config);

        let mut a = connect(&mut broker, addr);
        let mut b = connect(&mut broker, addr);
        let mut c = connect(&mut broker, addr);

        a.write_all(b"payload").unwrap();

        assert_eq!(read_exactly(&mut broker, &mut b, 7), b"payload".to_vec());
        assert_eq!(read_exactly(&mut broker, &mut c, 7), b"payload".to_vec());
        expect_nothing(&mut broker, &mut a);
    }

    #[test]
    fn test_chat_welcome_and_nickname() {
        let config = test_config();
        let (mut broker, addr) = test_broker(BrokerMode::Chat, &config);

        let mut a = connect(&mut broker, addr);
        let welcome = read_exactly(&mut broker, &mut a, chat::WELCOME.len());
        assert_eq!(welcome, chat::WELCOME.to_vec());

        a.write_all(b"alice\r\n").unwrap();
        let confirm = read_exactly(&mut broker, &mut a, chat::msg_known_as("alice").len());
        assert_eq!(confirm, chat::msg_known_as("alice"));
    }

    #[test]
    fn test_chat_nickname_collision_reprompts() {
        let config = test_config();
        let (mut broker, addr) = test_broker(BrokerMode::Chat, &config);

        let mut a = connect(&mut broker, addr);
        read_exactly(&mut broker, &mut a, chat::WELCOME.len());
        a.write_all(b"alice\n").unwrap();
        read_exactly(&mut broker, &mut a, chat::msg_known_as("alice").len());

        let mut b = connect(&mut broker, addr);
        read_exactly(&mut broker, &mut b, chat::WELCOME.len());
        b.write_all(b"alice\n").unwrap();

        let mut expected = chat::msg_rejection(NicknameRejection::Taken);
        expected.extend_from_slice(chat::NICK_REPROMPT);
        assert_eq!(read_exactly(&mut broker, &mut b, expected.len()), expected);

        // The holder of the name is untouched and B can still pick another.
        b.write_all(b"bob\n").unwrap();
        assert_eq!(
            read_exactly(&mut broker, &mut b, chat::msg_known_as("bob").len()),
            chat::msg_known_as("bob")
        );
        let join = chat::msg_joined("bob");
        assert_eq!(read_exactly(&mut broker, &mut a, join.len()), join);
    }

    #[test]
    fn test_chat_message_broadcast_format() {
        let config = test_config();
        let (mut broker, addr) = test_broker(BrokerMode::Chat, &config);

        let mut a = connect(&mut broker, addr);
        read_exactly(&mut broker, &mut a, chat::WELCOME.len());
        a.write_all(b"alice\n").unwrap();
        read_exactly(&mut broker, &mut a, chat::msg_known_as("alice").len());

        let mut b = connect(&mut broker, addr);
        read_exactly(&mut broker, &mut b, chat::WELCOME.len());
        b.write_all(b"bob\n").unwrap();
        read_exactly(&mut broker, &mut b, chat::msg_known_as("bob").len());
        // A sees bob join.
        read_exactly(&mut broker, &mut a, chat::msg_joined("bob").len());

        a.write_all(b"hello there\n").unwrap();
        let relayed = chat::msg_chat("alice", b"hello there");
        assert_eq!(read_exactly(&mut broker, &mut b, relayed.len()), relayed);
        expect_nothing(&mut broker, &mut a);
    }

    #[test]
    fn test_chat_rename_announced_to_everyone() {
        let config = test_config();
        let (mut broker, addr) = test_broker(BrokerMode::Chat, &config);

        let mut a = connect(&mut broker, addr);
        read_exactly(&mut broker, &mut a, chat::WELCOME.len());
        a.write_all(b"alice\n").unwrap();
        read_exactly(&mut broker, &mut a, chat::msg_known_as("alice").len());

        a.write_all(b"/nick alicia\n").unwrap();
        let announce = chat::msg_renamed("alice", "alicia");
        assert_eq!(read_exactly(&mut broker, &mut a, announce.len()), announce);
    }

    #[test]
    fn test_chat_too_many_failed_attempts_disconnects() {
        let config = test_config();
        let (mut broker, addr) = test_broker(BrokerMode::Chat, &config);

        let mut a = connect(&mut broker, addr);
        read_exactly(&mut broker, &mut a, chat::WELCOME.len());

        for _ in 0..chat::MAX_NICKNAME_ATTEMPTS {
            a.write_all(b"*bad*\n").unwrap();
            pump(&mut broker, 2);
        }

        // The socket ends up closed after the final notice.
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut saw_eof = false;
        let mut chunk = [0u8; 256];
        while Instant::now() < deadline {
            pump(&mut broker, 1);
            match a.read(&mut chunk) {
                Ok(0) => {
                    saw_eof = true;
                    break;
                }
                Ok(_) => {}
                Err(ref err)
                    if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut => {}
                Err(_) => {
                    saw_eof = true;
                    break;
                }
            }
        }
        assert!(saw_eof, "client should have been disconnected");
        assert_eq!(broker.client_count(), 0);
    }

    #[test]
    fn test_chat_flood_cap_defers_lines() {
        let config = test_config();
        let (mut broker, addr) = test_broker(BrokerMode::Chat, &config);

        let mut a = connect(&mut broker, addr);
        read_exactly(&mut broker, &mut a, chat::WELCOME.len());
        a.write_all(b"alice\n").unwrap();
        read_exactly(&mut broker, &mut a, chat::msg_known_as("alice").len());
        pump(&mut broker, 2);

        // Stuff the read buffer with a newline flood directly and run the
        // line processor for one tick.
        let id = *broker.clients.keys().next().unwrap();
        let now = Instant::now();
        {
            let client = broker.clients.get_mut(&id).unwrap();
            for slot in client.read_buf.iter_mut() {
                *slot = b'\n';
            }
            client.read_len = READ_BUF_SIZE;
            client.lines_this_tick = 0;
        }

        broker.process_lines(id, now);

        let client = broker.clients.get(&id).unwrap();
        assert_eq!(client.lines_this_tick, chat::MAX_LINES_PER_TICK);
        assert_eq!(client.read_len, READ_BUF_SIZE - chat::MAX_LINES_PER_TICK);
        assert!(client.defer_lines);

        // Ticks keep draining the backlog without starving the loop.
        pump(&mut broker, 1);
        let client = broker.clients.get(&id).unwrap();
        assert!(client.read_len < READ_BUF_SIZE - chat::MAX_LINES_PER_TICK);
    }

    #[test]
    fn test_idle_sweep_removes_quiet_clients() {
        let mut config = test_config();
        config.idle_timeout_ms = Some(50);
        let (mut broker, addr) = test_broker(BrokerMode::Relay, &config);

        let _a = connect(&mut broker, addr);
        assert_eq!(broker.client_count(), 1);

        thread::sleep(Duration::from_millis(120));
        // Force the maintenance path.
        let now = Instant::now();
        broker.maintenance(now);
        assert_eq!(broker.client_count(), 0);
    }

    #[test]
    fn test_access_denied_connection_is_closed() {
        let config = test_config();
        let listener = Listener::bind_tcp("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = match &listener {
            Listener::Tcp(l) => l.local_addr().unwrap(),
            #[cfg(unix)]
            _ => unreachable!(),
        };
        let mut access = AccessList::new();
        access.push_deny(crate::net::access::Rule::parse("127.0.0.1").unwrap());
        let pool = Arc::new(BufferPool::new(16 * CHUNK_CAPACITY, 1.0));
        let mut broker = Broker::new(
            listener,
            BrokerMode::Relay,
            &config,
            access,
            pool,
            &logging::discard(),
        )
        .unwrap();

        let mut stream = StdTcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        pump(&mut broker, 5);
        assert_eq!(broker.client_count(), 0);

        let mut chunk = [0u8; 16];
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            pump(&mut broker, 1);
            match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(_) => panic!("denied client should not receive data"),
                Err(ref err)
                    if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut => {}
                Err(_) => break,
            }
            if Instant::now() > deadline {
                panic!("denied connection never closed");
            }
        }
    }

    #[test]
    fn test_finish_broadcasts_shutdown_notice() {
        let config = test_config();
        let (mut broker, addr) = test_broker(BrokerMode::Chat, &config);

        let mut a = connect(&mut broker, addr);
        read_exactly(&mut broker, &mut a, chat::WELCOME.len());
        a.write_all(b"alice\n").unwrap();
        read_exactly(&mut broker, &mut a, chat::msg_known_as("alice").len());

        broker.finish();
        assert_eq!(broker.client_count(), 0);

        let mut collected = Vec::new();
        let mut chunk = [0u8; 256];
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            match a.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => collected.extend_from_slice(&chunk[..n]),
                Err(ref err)
                    if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut => {}
                Err(_) => break,
            }
        }
        assert_eq!(collected, chat::SHUTDOWN_NOTICE.to_vec());
    }
}
