//! Tor transport: a child `tor` process publishing the node's identity as a
//! v3 onion service, and SOCKS5 dialing through the same process.

mod control;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bb_core::config::TorConfig;
use bb_crypto::{split_host_port, Identity, NodeAddress};
use bb_tls::BoxedIo;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_socks::tcp::Socks5Stream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use self::control::{parse_control_port_file, TorControl};
use super::{Registration, Transport};
use crate::{NetError, NetResult};

const CONTROL_PORT_FILE: &str = "control-port";
const COOKIE_FILE: &str = "control_auth_cookie";
const TORRC_FILE: &str = "torrc";
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Where and how to run Tor.
#[derive(Debug, Clone)]
pub struct TorSettings {
    pub binary: PathBuf,
    /// Tor's `DataDirectory`; kept across restarts so the consensus cache is reused.
    pub data_dir: PathBuf,
    pub onion_port: u16,
    /// Bound for starting Tor, bootstrapping and publishing the service.
    pub start_timeout: Duration,
}

impl TorSettings {
    pub fn from_config(config: &TorConfig, data_dir: PathBuf) -> Self {
        Self {
            binary: config.binary.clone(),
            data_dir,
            onion_port: config.onion_port,
            start_timeout: config.start_timeout(),
        }
    }
}

/// A running Tor instance with one published onion service.
struct Running {
    child: Child,
    control: TorControl,
    socks: SocketAddr,
    service_id: String,
    accept: CancellationToken,
    control_port_file: PathBuf,
}

enum TorState {
    Stopped,
    /// `serve` is launching Tor; the state lock is not held meanwhile.
    Starting,
    Running(Running),
}

type SharedState = Arc<Mutex<TorState>>;

fn lock(state: &SharedState) -> MutexGuard<'_, TorState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Puts the transport back to `Stopped` when a launch fails or is dropped.
struct LaunchGuard {
    state: SharedState,
    armed: bool,
}

impl Drop for LaunchGuard {
    fn drop(&mut self) {
        if self.armed {
            let mut state = lock(&self.state);
            if matches!(*state, TorState::Starting) {
                *state = TorState::Stopped;
            }
        }
    }
}

/// Transport over the Tor network. Tor is started by [`Transport::serve`];
/// dialing is only possible while it runs.
#[derive(Clone)]
pub struct TorTransport {
    settings: TorSettings,
    state: SharedState,
}

impl TorTransport {
    pub fn new(settings: TorSettings) -> Self {
        Self {
            settings,
            state: Arc::new(Mutex::new(TorState::Stopped)),
        }
    }

    pub fn settings(&self) -> &TorSettings {
        &self.settings
    }

    async fn launch(
        &self,
        address: &NodeAddress,
        identity: &Identity,
        incoming: mpsc::Sender<BoxedIo>,
    ) -> NetResult<Running> {
        let data_dir = &self.settings.data_dir;
        prepare_data_dir(data_dir)?;

        let control_port_file = data_dir.join(CONTROL_PORT_FILE);
        remove_if_exists(&control_port_file)?;
        let torrc = data_dir.join(TORRC_FILE);
        if !torrc.exists() {
            std::fs::write(&torrc, "")?;
        }

        let mut child = Command::new(&self.settings.binary)
            .arg("-f")
            .arg(&torrc)
            .arg("--DataDirectory")
            .arg(data_dir)
            .args(["--SocksPort", "auto", "--ControlPort", "auto"])
            .arg("--ControlPortWriteToFile")
            .arg(&control_port_file)
            .args(["--CookieAuthentication", "1"])
            .arg("--__OwningControllerProcess")
            .arg(std::process::id().to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                NetError::Tor(format!("spawning {}: {e}", self.settings.binary.display()))
            })?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "tor", "{line}");
                }
            });
        }

        let control_addr = wait_for_control_port(&mut child, &control_port_file).await?;
        let mut control = TorControl::connect(control_addr).await?;
        control.authenticate_cookie(&data_dir.join(COOKIE_FILE)).await?;

        let mut last = None;
        loop {
            let progress = control.bootstrap_progress().await?;
            if last != Some(progress) {
                info!(progress, "tor bootstrapping");
                last = Some(progress);
            }
            if progress >= 100 {
                break;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        let socks = control.socks_listener().await?;

        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let local = listener.local_addr()?;
        let service_id = control
            .add_onion(&identity.expanded_secret(), self.settings.onion_port, local)
            .await?;
        if format!("{service_id}.onion") != address.as_str() {
            let _ = control.del_onion(&service_id).await;
            return Err(NetError::Tor(format!(
                "published {service_id}.onion, expected {address}"
            )));
        }
        info!(
            remote_port = self.settings.onion_port,
            local_port = local.port(),
            "Tor onion service started"
        );

        let accept = CancellationToken::new();
        tokio::spawn(accept_loop(listener, incoming, accept.clone()));

        Ok(Running {
            child,
            control,
            socks,
            service_id,
            accept,
            control_port_file,
        })
    }
}

#[async_trait]
impl Transport for TorTransport {
    async fn serve(
        &self,
        address: &NodeAddress,
        identity: &Identity,
        incoming: mpsc::Sender<BoxedIo>,
    ) -> NetResult<Registration> {
        {
            let mut state = lock(&self.state);
            if !matches!(*state, TorState::Stopped) {
                return Err(NetError::AddressInUse(address.to_string()));
            }
            *state = TorState::Starting;
        }
        let mut guard = LaunchGuard {
            state: self.state.clone(),
            armed: true,
        };

        let timeout = self.settings.start_timeout;
        // Dropping a timed-out launch kills the child process.
        let started = tokio::time::timeout(timeout, self.launch(address, identity, incoming))
            .await
            .map_err(|_| NetError::Tor(format!("startup timed out after {timeout:?}")))??;
        *lock(&self.state) = TorState::Running(started);
        guard.armed = false;

        let state = self.state.clone();
        Ok(Registration::new(async move { shutdown(state).await }))
    }

    async fn dial(&self, address: &str) -> NetResult<BoxedIo> {
        let socks = match &*lock(&self.state) {
            TorState::Running(running) => running.socks,
            TorState::Starting => {
                return Err(NetError::TransportUnavailable("tor is still starting"))
            }
            TorState::Stopped => {
                return Err(NetError::TransportUnavailable("tor not started; serve first"))
            }
        };

        let address = address.trim();
        if !address.contains(".onion") {
            return Err(NetError::InvalidAddress {
                addr: address.to_string(),
                reason: "address must be a .onion hostname".into(),
            });
        }
        let (host, port) = split_host_port(address)?;

        let stream = TcpStream::connect(socks).await?;
        let stream = socks_connect(stream, host, port).await?;
        debug!(%host, port, "tor circuit established");
        Ok(Box::new(stream))
    }
}

/// SOCKS5 CONNECT by hostname through Tor's SOCKS port, so the onion name is
/// resolved by Tor. Returns the tunneled stream.
async fn socks_connect<S>(proxy: S, host: &str, port: u16) -> NetResult<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    match Socks5Stream::connect_with_socket(proxy, (host, port)).await {
        Ok(stream) => Ok(stream.into_inner()),
        Err(tokio_socks::Error::Io(e)) => Err(NetError::Io(e)),
        Err(e) => Err(NetError::Dial {
            addr: format!("{host}:{port}"),
            reason: e.to_string(),
        }),
    }
}

/// Stop accepting, remove the onion service and stop Tor. The data
/// directory stays for the next start.
async fn shutdown(state: SharedState) -> NetResult<()> {
    let taken = std::mem::replace(&mut *lock(&state), TorState::Stopped);
    let mut running = match taken {
        TorState::Running(running) => running,
        other => {
            *lock(&state) = other;
            return Ok(());
        }
    };

    running.accept.cancel();
    let removed = running.control.del_onion(&running.service_id).await;
    drop(running.control);

    if let Err(e) = running.child.kill().await {
        debug!(error = %e, "tor already exited");
    }
    if let Err(e) = remove_if_exists(&running.control_port_file) {
        warn!(error = %e, "failed to remove control port file");
    }
    info!("Tor stopped");
    removed
}

async fn accept_loop(
    listener: TcpListener,
    incoming: mpsc::Sender<BoxedIo>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, _)) => {
                if incoming.send(Box::new(stream)).await.is_err() {
                    break;
                }
            }
            Err(e) => warn!(error = %e, "onion listener accept failed"),
        }
    }
    debug!("onion listener closed");
}

async fn wait_for_control_port(child: &mut Child, file: &Path) -> NetResult<SocketAddr> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Err(NetError::Tor(format!("tor exited during startup: {status}")));
        }
        if let Ok(contents) = tokio::fs::read_to_string(file).await {
            if let Some(addr) = parse_control_port_file(&contents) {
                return Ok(addr);
            }
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

fn prepare_data_dir(dir: &Path) -> std::io::Result<()> {
    let existed = dir.is_dir();
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir)?;

    if existed {
        info!(dir = %dir.display(), "Tor data dir (reuse)");
    } else {
        info!(dir = %dir.display(), "Tor data dir (created)");
    }
    Ok(())
}

fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bb_crypto::derive_identity;

    fn settings(data_dir: PathBuf) -> TorSettings {
        TorSettings {
            binary: PathBuf::from("/nonexistent/bin/tor"),
            data_dir,
            onion_port: 80,
            start_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_dial_before_serve() {
        let tmp = tempfile::tempdir().unwrap();
        let tor = TorTransport::new(settings(tmp.path().join("tor")));
        let err = tor.dial("abc.onion:80").await.err().unwrap();
        assert!(matches!(err, NetError::TransportUnavailable(_)));
    }

    #[tokio::test]
    async fn test_serve_without_tor_binary() {
        let tmp = tempfile::tempdir().unwrap();
        let data_dir = tmp.path().join("tor");
        let tor = TorTransport::new(settings(data_dir.clone()));

        let identity = derive_identity(&[7u8; 64], "tor/onion/v3").unwrap();
        let (tx, _rx) = mpsc::channel(1);
        let err = tor
            .serve(&identity.address(), &identity, tx)
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::Tor(ref msg) if msg.starts_with("spawning")));

        // Nothing left running; the data dir is prepared for the next try.
        assert!(matches!(*lock(&tor.state), TorState::Stopped));
        assert!(data_dir.is_dir());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&data_dir).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
        }
    }

    /// `/bin/sh` runs the torrc as a script: a Tor that never writes its
    /// control port file.
    #[cfg(unix)]
    #[tokio::test]
    async fn test_dial_while_starting_fails_fast() {
        let tmp = tempfile::tempdir().unwrap();
        let data_dir = tmp.path().join("tor");
        std::fs::create_dir_all(&data_dir).unwrap();
        std::fs::write(data_dir.join(TORRC_FILE), "exec sleep 30\n").unwrap();

        let mut hung = settings(data_dir);
        hung.binary = PathBuf::from("/bin/sh");
        hung.start_timeout = Duration::from_secs(60);
        let tor = TorTransport::new(hung);

        let identity = derive_identity(&[8u8; 64], "tor/onion/v3").unwrap();
        let serving = tokio::spawn({
            let tor = tor.clone();
            let identity = identity.clone();
            async move {
                let (tx, _rx) = mpsc::channel(1);
                tor.serve(&identity.address(), &identity, tx).await
            }
        });
        while !matches!(*lock(&tor.state), TorState::Starting) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let dialed = tokio::time::timeout(Duration::from_secs(1), tor.dial("abc.onion:80"))
            .await
            .expect("dial blocked behind the launch");
        assert!(matches!(
            dialed.err().unwrap(),
            NetError::TransportUnavailable("tor is still starting")
        ));

        let (tx, _rx) = mpsc::channel(1);
        assert!(matches!(
            tor.serve(&identity.address(), &identity, tx).await,
            Err(NetError::AddressInUse(_))
        ));

        // Dropping the launch puts the transport back to stopped.
        serving.abort();
        assert!(serving.await.unwrap_err().is_cancelled());
        assert!(matches!(*lock(&tor.state), TorState::Stopped));
    }

    /// Plays Tor's SOCKS port: accepts no-auth, answers CONNECT with `reply`,
    /// then sends a payload. Returns the requested host and port.
    async fn fake_socks(mut s: tokio::io::DuplexStream, reply: u8) -> (String, u16) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let mut greeting = [0u8; 2];
        s.read_exact(&mut greeting).await.unwrap();
        let mut methods = vec![0u8; greeting[1] as usize];
        s.read_exact(&mut methods).await.unwrap();
        assert!(methods.contains(&0x00));
        s.write_all(&[5, 0]).await.unwrap();

        let mut head = [0u8; 5];
        s.read_exact(&mut head).await.unwrap();
        assert_eq!(&head[..4], &[5, 1, 0, 3], "CONNECT by domain name");
        let mut host = vec![0u8; head[4] as usize];
        s.read_exact(&mut host).await.unwrap();
        let mut port = [0u8; 2];
        s.read_exact(&mut port).await.unwrap();

        s.write_all(&[5, reply, 0, 1, 0, 0, 0, 0, 0, 0]).await.unwrap();
        s.write_all(b"tunnel").await.unwrap();
        (String::from_utf8(host).unwrap(), u16::from_be_bytes(port))
    }

    #[tokio::test]
    async fn test_socks_connect_by_hostname() {
        use tokio::io::AsyncReadExt;

        let (client, server) = tokio::io::duplex(1024);
        let proxy = tokio::spawn(fake_socks(server, 0));

        let mut tunnel = socks_connect(client, "example.onion", 80).await.unwrap();
        assert_eq!(proxy.await.unwrap(), ("example.onion".to_string(), 80));

        let mut payload = [0u8; 6];
        tunnel.read_exact(&mut payload).await.unwrap();
        assert_eq!(&payload, b"tunnel");
    }

    #[tokio::test]
    async fn test_socks_refusal_is_dial_error() {
        let (client, server) = tokio::io::duplex(1024);
        tokio::spawn(fake_socks(server, 0x05));

        match socks_connect(client, "gone.onion", 80).await {
            Err(NetError::Dial { addr, .. }) => assert_eq!(addr, "gone.onion:80"),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("refused CONNECT succeeded"),
        }
    }

    #[test]
    fn test_settings_from_config() {
        let config = TorConfig::default();
        let s = TorSettings::from_config(&config, PathBuf::from("/data/tor"));
        assert_eq!(s.binary, PathBuf::from("tor"));
        assert_eq!(s.onion_port, 80);
        assert_eq!(s.start_timeout, Duration::from_secs(180));
        assert_eq!(s.data_dir, PathBuf::from("/data/tor"));
    }
}
