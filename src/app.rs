//! Main application lifecycle and coordination.
//!
//! This module wires the protocol engine to a real UDP socket: it holds the
//! single-instance lock, loads the key ring, runs the receive loop with the
//! periodic retry sweep, and optionally reads console commands from stdin.

use crate::{
    crypto::{KeyRing, KeyStore},
    engine::{EngineEvent, EngineObserver, ProtocolEngine, SendOptions},
    network::Peer,
    transport::{PacketCodec, UdpSink, Utf8Transcoder},
    utils::{ConfigError, IpmsgConfig, IpmsgError, KeyStoreError, Result},
};
use std::fs::OpenOptions;
use std::io::Write;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UdpSocket;

/// Main application structure
pub struct App {
    /// Application configuration
    config: IpmsgConfig,
    /// Protocol engine shared with spawned send tasks
    engine: Arc<ProtocolEngine>,
    /// Socket the engine's sink writes to
    socket: Arc<UdpSocket>,
    /// Held for the lifetime of the process
    _lock: InstanceLock,
}

impl App {
    /// Create a new application instance.
    ///
    /// `passphrase` unlocks the private keys; it must match
    /// `crypto.passphrase_hash` when one is configured.
    ///
    /// # Errors
    ///
    /// `AlreadyRunning` if another instance holds the lock, key store
    /// failures, or a socket that cannot be bound.
    pub async fn new(config: IpmsgConfig, passphrase: Option<String>) -> Result<Self> {
        Self::with_observer(config, passphrase, Arc::new(ConsoleObserver)).await
    }

    /// As [`App::new`], reporting engine events to `observer`
    ///
    /// # Errors
    ///
    /// As [`App::new`].
    pub async fn with_observer(
        config: IpmsgConfig,
        passphrase: Option<String>,
        observer: Arc<dyn EngineObserver>,
    ) -> Result<Self> {
        config.ensure_directories()?;
        let lock = InstanceLock::acquire(&config.storage.lock_file)?;

        let keys = if config.crypto.enabled {
            let config = config.clone();
            let ring = tokio::task::spawn_blocking(move || load_key_ring(&config, passphrase.as_deref()))
                .await
                .map_err(|e| IpmsgError::unexpected(format!("key loading task: {e}")))??;
            Some(Arc::new(ring))
        } else {
            None
        };

        let bind = SocketAddr::new(config.network.bind_address, config.network.port);
        let socket = UdpSink::bind(bind).await?;
        let codec = PacketCodec::new(
            config.identity.user.as_str(),
            config.identity.host.as_str(),
            Arc::new(Utf8Transcoder),
        )?;
        let sink = Arc::new(UdpSink::new(socket.clone()));
        let engine = ProtocolEngine::from_config(&config, codec, keys, sink).with_observer(observer);

        Ok(Self {
            config,
            engine: Arc::new(engine),
            socket,
            _lock: lock,
        })
    }

    /// The running engine
    pub fn engine(&self) -> &Arc<ProtocolEngine> {
        &self.engine
    }

    /// Address the socket is bound to
    ///
    /// # Errors
    ///
    /// `Io` if the socket cannot report it.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Run until Ctrl-C
    ///
    /// # Errors
    ///
    /// Fails only if the socket itself fails; per-packet errors are logged.
    pub async fn run(self) -> Result<()> {
        self.run_with_console(false).await
    }

    /// Run until Ctrl-C or `/quit`, reading commands from stdin when
    /// `interactive` is set
    ///
    /// # Errors
    ///
    /// Fails only if the socket itself fails; per-packet errors are logged.
    pub async fn run_with_console(self, interactive: bool) -> Result<()> {
        log::info!(
            "Starting IPMSG engine as {}@{} ({})",
            self.config.identity.user,
            self.config.identity.host,
            if self.engine.crypto_enabled() { "encryption on" } else { "encryption off" }
        );

        self.engine.send_br_entry()?;
        if self.config.hostlist.want {
            self.engine.send_br_isgetlist2()?;
        }

        let mut buf = vec![0u8; self.config.network.max_packet_size];
        let mut sweep = tokio::time::interval(self.config.delivery.sweep_tick());
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        if interactive {
            print_help();
        }

        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, from)) => self.engine.handle_datagram(from, &buf[..len]),
                        Err(e) => log::warn!("Receive failed: {e}"),
                    }
                }
                _ = sweep.tick() => {
                    self.engine.sweep_retries();
                }
                line = lines.next_line(), if interactive => {
                    match line {
                        Ok(Some(line)) => {
                            if !self.handle_console_line(&line) {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            log::warn!("Console read failed: {e}");
                            break;
                        }
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    log::info!("Shutdown signal received");
                    break;
                }
            }
        }

        self.shutdown()
    }

    /// Announce our exit
    fn shutdown(&self) -> Result<()> {
        log::info!("Shutting down");
        self.engine.send_br_exit()?;
        Ok(())
    }

    /// Returns false when the loop should stop
    fn handle_console_line(&self, line: &str) -> bool {
        let command = match ConsoleCommand::parse(line, self.config.network.port) {
            Ok(Some(command)) => command,
            Ok(None) => return true,
            Err(e) => {
                println!("{e}");
                return true;
            }
        };

        let result = match command {
            ConsoleCommand::Quit => return false,
            ConsoleCommand::Help => {
                print_help();
                Ok(())
            }
            ConsoleCommand::List => {
                print_peers(&self.engine.peers().sorted_snapshot());
                Ok(())
            }
            ConsoleCommand::Refresh => {
                self.engine.peers().invalidate_all();
                self.engine.send_br_entry().map(|_| ())
            }
            ConsoleCommand::Info(to) => self.engine.send_get_info(to).map(|_| ()),
            ConsoleCommand::AbsenceInfo(to) => self.engine.send_get_absence_info(to).map(|_| ()),
            ConsoleCommand::Absence(text) => self.engine.set_absence(text).map(|_| ()),
            ConsoleCommand::Send { to, text, sealed } => {
                let engine = self.engine.clone();
                let options = SendOptions {
                    secret: sealed,
                    read_check: sealed,
                    ..SendOptions::default()
                };
                tokio::spawn(async move {
                    match engine.send_send_msg(to, &text, options).await {
                        Ok(packet_no) => log::debug!("Message {packet_no} sent to {to}"),
                        Err(e) => println!("! could not send to {to}: {e}"),
                    }
                });
                Ok(())
            }
        };
        if let Err(e) = result {
            println!("! {e}");
        }
        true
    }
}

/// Load or create the RSA key slots named by the configuration
///
/// # Errors
///
/// The private key files are encrypted with a PBKDF2 secret derived from
/// `passphrase` and the salt of `crypto.passphrase_hash`. Without a
/// configured hash the keys are stored unprotected.
///
/// # Errors
///
/// `WrongPassphrase` if a passphrase hash is configured and `passphrase`
/// does not match it, plus everything [`KeyRing::init_keys`] returns.
pub fn load_key_ring(config: &IpmsgConfig, passphrase: Option<&str>) -> Result<KeyRing> {
    let store = KeyStore::open(&config.storage.keys_dir)?;
    let secret = match (config.crypto.passphrase()?, passphrase) {
        (Some(hash), Some(passphrase)) if hash.verify(passphrase) => {
            Some(hash.key_file_secret(passphrase))
        }
        (Some(_), _) => {
            return Err(KeyStoreError::WrongPassphrase {
                path: store.dir().display().to_string(),
            }
            .into())
        }
        (None, Some(_)) => {
            log::warn!("Ignoring passphrase: crypto.passphrase_hash is not configured");
            None
        }
        (None, None) => None,
    };
    KeyRing::init_keys(&store, &config.crypto.rsa_sizes()?, secret.as_deref().map(String::as_str))
}

/// A parsed console line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// Show visible peers
    List,
    /// Send a message
    Send {
        /// Recipient
        to: SocketAddr,
        /// Body
        text: String,
        /// Sealed with read notification
        sealed: bool,
    },
    /// Ask for a peer's version
    Info(SocketAddr),
    /// Ask for a peer's absence text
    AbsenceInfo(SocketAddr),
    /// Enter (`Some`) or leave (`None`) absence mode
    Absence(Option<String>),
    /// Forget every peer and re-announce
    Refresh,
    /// Show the command list
    Help,
    /// Leave
    Quit,
}

impl ConsoleCommand {
    /// Parse one line; blank lines yield `None`
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for unknown commands or bad addresses.
    pub fn parse(line: &str, default_port: u16) -> Result<Option<Self>> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let (word, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim();

        let command = match word {
            "/list" | "/ls" => Self::List,
            "/refresh" => Self::Refresh,
            "/help" | "/?" => Self::Help,
            "/quit" | "/exit" => Self::Quit,
            "/info" => Self::Info(parse_peer_addr(rest, default_port)?),
            "/away?" => Self::AbsenceInfo(parse_peer_addr(rest, default_port)?),
            "/absence" | "/away" => Self::Absence((!rest.is_empty()).then(|| rest.to_string())),
            "/msg" | "/smsg" => {
                let (addr, text) = rest
                    .split_once(char::is_whitespace)
                    .ok_or_else(|| IpmsgError::invalid_argument(format!("usage: {word} <address> <text>")))?;
                Self::Send {
                    to: parse_peer_addr(addr, default_port)?,
                    text: text.trim().to_string(),
                    sealed: word == "/smsg",
                }
            }
            other => return Err(IpmsgError::invalid_argument(format!("unknown command {other}, try /help"))),
        };
        Ok(Some(command))
    }
}

/// `ip` or `ip:port`
fn parse_peer_addr(text: &str, default_port: u16) -> Result<SocketAddr> {
    if let Ok(addr) = text.parse::<SocketAddr>() {
        return Ok(addr);
    }
    text.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, default_port))
        .map_err(|_| IpmsgError::invalid_argument(format!("not an address: {text:?}")))
}

fn print_help() {
    println!("Commands:");
    println!("  /list                   show peers");
    println!("  /msg <addr> <text>      send a message");
    println!("  /smsg <addr> <text>     send a sealed message");
    println!("  /info <addr>            ask for a peer's version");
    println!("  /away? <addr>           ask for a peer's absence text");
    println!("  /absence [text]         set or clear absence mode");
    println!("  /refresh                rebuild the peer list");
    println!("  /quit                   leave");
}

fn print_peers(peers: &[Peer]) {
    if peers.is_empty() {
        println!("(no peers)");
        return;
    }
    for peer in peers {
        println!(
            "  {:<16} {:<20} {:<12} {}{}",
            peer.ipaddr,
            peer.display_name(),
            peer.group,
            if peer.public_key.is_some() { "[key]" } else { "" },
            if peer.is_absent() { " [away]" } else { "" },
        );
    }
}

/// Prints engine events to the console
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleObserver;

impl EngineObserver for ConsoleObserver {
    fn on_event(&self, event: &EngineEvent) {
        match event {
            EngineEvent::MessageArrived(message) => {
                let lock = if message.encrypted { " (encrypted)" } else { "" };
                let seal = if message.is_sealed() { " [sealed]" } else { "" };
                println!(
                    "[{}] {}@{} {}{lock}{seal}: {}",
                    message.received_at.format("%H:%M:%S"),
                    message.user,
                    message.host,
                    message.from.ip(),
                    message.text
                );
            }
            EngineEvent::InfoReceived { from, absence, text } => {
                let what = if *absence { "absence" } else { "version" };
                println!("{} {what}: {text}", from.ip());
            }
            EngineEvent::ReadNotified { from, packet_no, .. } => {
                println!("{} opened message {packet_no}", from.ip());
            }
            EngineEvent::DeliveryFailed { dest, packet_no } => {
                println!("! message {packet_no} to {} was not acknowledged", dest.ip());
            }
            EngineEvent::Error { from, message } => match from {
                Some(from) => log::warn!("{from}: {message}"),
                None => log::warn!("{message}"),
            },
        }
    }
}

/// Writes each engine event as one JSON line on stdout
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonObserver;

impl EngineObserver for JsonObserver {
    fn on_event(&self, event: &EngineEvent) {
        match serde_json::to_string(event) {
            Ok(line) => println!("{line}"),
            Err(e) => log::warn!("Could not serialize event: {e}"),
        }
    }
}

/// Exclusive lock file holding our PID; removed on drop
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
}

impl InstanceLock {
    /// Create the lock file, taking over one left behind by a process that
    /// no longer exists.
    ///
    /// # Errors
    ///
    /// `AlreadyRunning` if the file belongs to a live process, `Io` otherwise.
    pub fn acquire(path: &Path) -> Result<Self> {
        let mut file = match Self::create(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = std::fs::read_to_string(path)
                    .ok()
                    .and_then(|text| text.trim().parse::<u32>().ok());
                if holder.is_some_and(process_alive) {
                    return Err(ConfigError::AlreadyRunning {
                        path: path.display().to_string(),
                    }
                    .into());
                }
                log::warn!(
                    "Replacing stale lock file {} (holder {holder:?} is gone)",
                    path.display()
                );
                std::fs::remove_file(path)?;
                Self::create(path).map_err(|e| match e.kind() {
                    std::io::ErrorKind::AlreadyExists => IpmsgError::from(ConfigError::AlreadyRunning {
                        path: path.display().to_string(),
                    }),
                    _ => IpmsgError::from(e),
                })?
            }
            Err(e) => return Err(e.into()),
        };
        writeln!(file, "{}", std::process::id())?;
        log::debug!("Acquired instance lock {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    fn create(path: &Path) -> std::io::Result<std::fs::File> {
        OpenOptions::new().write(true).create_new(true).open(path)
    }
}

/// Whether `pid` names a running process. EPERM means it exists but
/// belongs to someone else.
#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    matches!(kill(Pid::from_raw(raw), None), Ok(()) | Err(Errno::EPERM))
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            log::warn!("Could not remove lock file {}: {e}", self.path.display());
        }
    }
}
