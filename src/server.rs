//! Server assembly: store, worker pool, transport, and the dispatch loop.
//!
//! Construction order matters: the write-ahead log is replayed (when
//! `recover` is set) before the listener exists, so no client can observe
//! a partially recovered index. `run` then drives the dispatch loop on the
//! calling thread. Tests use [`Server::spawn`], which builds and runs the
//! whole server on a background thread and tears it down through a stop
//! flag checked once per dispatch pass.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};

use crate::cleaner::EpochRegistry;
use crate::config::Config;
use crate::dispatch::Dispatch;
use crate::error::{Error, Result};
use crate::store::Store;
use crate::transport::ServerTransport;
use crate::worker::{ManagerPoller, WorkerManager};

pub struct Server {
    dispatch: Dispatch,
    manager: Rc<RefCell<WorkerManager>>,
    transport: ServerTransport,
    store: Arc<Store>,
}

impl Server {
    /// Builds a ready-to-run server: recovery done, workers polling,
    /// listener registered. Fails fast on configuration and socket errors.
    pub fn new(config: Config) -> Result<Server> {
        let listen = config
            .listen
            .clone()
            .ok_or_else(|| Error::Config("server requires a listen address".into()))?;

        let registry = EpochRegistry::new(config.max_cores);
        let store = Arc::new(Store::open(&config, Arc::clone(&registry))?);

        let mut dispatch = Dispatch::new()?;
        let manager = Rc::new(RefCell::new(WorkerManager::new(
            Arc::clone(&store),
            registry,
            config.max_cores,
            config.poll_micros,
            config.waiting_rpc_limit,
        )));

        let transport = ServerTransport::bind(&listen)?;
        manager.borrow_mut().attach_transport(Rc::clone(&transport.state));
        transport.start(dispatch.reactor(), Rc::clone(&manager))?;
        dispatch.add_poller(Box::new(ManagerPoller(Rc::clone(&manager))));

        tracing::info!(
            addr = %transport.local_addr(),
            workers = config.max_cores,
            recover = config.recover,
            "server ready"
        );
        Ok(Server { dispatch, manager, transport, store })
    }

    /// The bound address (with the kernel-assigned port for `:0` locators).
    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Drives the dispatch loop forever on the calling thread.
    pub fn run(mut self) -> Result<()> {
        loop {
            self.dispatch.poll();
        }
    }

    /// Drives the dispatch loop until `stop` is raised, then shuts down:
    /// in-flight RPCs finish, worker threads join, the log writer drains,
    /// and sockets close.
    pub fn run_until(mut self, stop: &AtomicBool) {
        while !stop.load(Ordering::Acquire) {
            self.dispatch.poll();
        }
        self.manager.borrow_mut().shutdown(self.dispatch.reactor());
        tracing::info!("server stopped");
    }

    /// Builds and runs a server on a background thread. Returns once the
    /// listener is bound, or with the construction error.
    pub fn spawn(config: Config) -> Result<ServerHandle> {
        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = mpsc::channel();
        let join = {
            let stop = Arc::clone(&stop);
            std::thread::Builder::new().name("gungnir-dispatch".into()).spawn(move || {
                match Server::new(config) {
                    Ok(server) => {
                        let _ = ready_tx.send(Ok(server.local_addr()));
                        server.run_until(&stop);
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                    }
                }
            })?
        };
        match ready_rx.recv() {
            Ok(Ok(local_addr)) => Ok(ServerHandle { stop, join: Some(join), local_addr }),
            Ok(Err(err)) => {
                let _ = join.join();
                Err(err)
            }
            Err(_) => {
                let _ = join.join();
                Err(Error::Transport("server thread died during startup".into()))
            }
        }
    }
}

/// Owner of a background server started with [`Server::spawn`].
pub struct ServerHandle {
    stop: Arc<AtomicBool>,
    join: Option<std::thread::JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops the dispatch loop and waits for orderly teardown.
    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::tmpfs::NamedTempFile;
    use crate::wire::{Header, Status, HEADER_SIZE};

    fn spawn_server(file: &NamedTempFile, configure: impl FnOnce(Config) -> Config) -> ServerHandle {
        let config = configure(
            Config::default().listen("127.0.0.1:0").log_file_path(file.path()).max_cores(2),
        );
        Server::spawn(config).unwrap()
    }

    fn connect(handle: &ServerHandle) -> Client {
        Client::connect(&handle.local_addr().to_string()).unwrap()
    }

    #[test]
    fn startup_requires_listen_address_and_log_path() {
        let file = NamedTempFile::new().unwrap();
        assert!(matches!(
            Server::spawn(Config::default().log_file_path(file.path())),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            Server::spawn(Config::default().listen("127.0.0.1:0")),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn single_session_operations() {
        let file = NamedTempFile::new().unwrap();
        let handle = spawn_server(&file, |config| config);
        let mut client = connect(&handle);

        client.put(12, b"12").unwrap();
        client.put(200, b"123").unwrap();
        assert_eq!(client.get(200).unwrap(), Some(b"123".to_vec()));
        client.erase(7).unwrap();
        assert_eq!(client.get(7).unwrap(), None);
        assert_eq!(client.get(12).unwrap(), Some(b"12".to_vec()));

        handle.shutdown();
    }

    #[test]
    fn put_overwrite_visibility() {
        let file = NamedTempFile::new().unwrap();
        let handle = spawn_server(&file, |config| config);
        let mut client = connect(&handle);

        client.put(5, b"v1").unwrap();
        client.put(5, b"v2").unwrap();
        assert_eq!(client.get(5).unwrap(), Some(b"v2".to_vec()));
        handle.shutdown();
    }

    #[test]
    fn dense_range_scan() {
        let file = NamedTempFile::new().unwrap();
        let handle = spawn_server(&file, |config| config);
        let mut client = connect(&handle);

        for key in 2000..=2500u64 {
            client.put(key, key.to_string().as_bytes()).unwrap();
        }
        let items: Vec<(u64, Vec<u8>)> =
            client.scan(2000, 2500).unwrap().map(|item| item.unwrap()).collect();
        assert_eq!(items.len(), 501);
        for (i, (key, value)) in items.iter().enumerate() {
            assert_eq!(*key, 2000 + i as u64);
            assert_eq!(value, key.to_string().as_bytes());
        }
        // Scan bounds are inclusive on both ends.
        let inner: Vec<u64> =
            client.scan(2001, 2499).unwrap().map(|item| item.unwrap().0).collect();
        assert_eq!(inner.first(), Some(&2001));
        assert_eq!(inner.last(), Some(&2499));

        handle.shutdown();
    }

    #[test]
    fn idempotent_erase() {
        let file = NamedTempFile::new().unwrap();
        let handle = spawn_server(&file, |config| config);
        let mut client = connect(&handle);

        client.put(1, b"a").unwrap();
        client.erase(1).unwrap();
        client.erase(1).unwrap();
        assert_eq!(client.get(1).unwrap(), None);
        handle.shutdown();
    }

    #[test]
    fn concurrent_puts_to_same_key() {
        let file = NamedTempFile::new().unwrap();
        let handle = spawn_server(&file, |config| config);
        let addr = handle.local_addr().to_string();

        let writers: Vec<_> = (0..8u64)
            .map(|client_id| {
                let addr = addr.clone();
                std::thread::spawn(move || {
                    let mut client = Client::connect(&addr).unwrap();
                    for seq in 0..100u64 {
                        let value = format!("{client_id}:{seq}");
                        client.put(42, value.as_bytes()).unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let mut client = connect(&handle);
        let value = client.get(42).unwrap().expect("key exists");
        let text = String::from_utf8(value).unwrap();
        let (client_id, seq) = text.split_once(':').expect("value is clientId:seq");
        assert!(client_id.parse::<u64>().unwrap() < 8);
        assert!(seq.parse::<u64>().unwrap() < 100);
        // Exactly one live node for the contended key.
        let items: Vec<u64> = client.scan(42, 42).unwrap().map(|item| item.unwrap().0).collect();
        assert_eq!(items, vec![42]);

        handle.shutdown();
    }

    #[test]
    fn crash_recovery_round_trip() {
        let file = NamedTempFile::new().unwrap();
        {
            let handle = spawn_server(&file, |config| config);
            let mut client = connect(&handle);
            client.put(1, b"x").unwrap();
            client.put(2, b"y").unwrap();
            client.erase(1).unwrap();
            // Responses observed: everything above is durable. Stop without
            // any further flushing, as an abrupt exit would.
            handle.shutdown();
        }

        let handle = spawn_server(&file, |config| config.recover(true));
        let mut client = connect(&handle);
        assert_eq!(client.get(1).unwrap(), None);
        assert_eq!(client.get(2).unwrap(), Some(b"y".to_vec()));
        assert_eq!(client.get(3).unwrap(), None);
        handle.shutdown();
    }

    #[test]
    fn recovery_survives_two_generations() {
        let file = NamedTempFile::new().unwrap();
        {
            let handle = spawn_server(&file, |config| config);
            let mut client = connect(&handle);
            for key in 0..20u64 {
                client.put(key, &key.to_le_bytes()).unwrap();
            }
            handle.shutdown();
        }
        {
            let handle = spawn_server(&file, |config| config.recover(true));
            let mut client = connect(&handle);
            for key in 0..10u64 {
                client.erase(key).unwrap();
            }
            client.put(100, b"second generation").unwrap();
            handle.shutdown();
        }

        let handle = spawn_server(&file, |config| config.recover(true));
        let mut client = connect(&handle);
        assert_eq!(client.get(5).unwrap(), None);
        assert_eq!(client.get(15).unwrap(), Some(15u64.to_le_bytes().to_vec()));
        assert_eq!(client.get(100).unwrap(), Some(b"second generation".to_vec()));
        let keys: Vec<u64> = client.scan(0, u64::MAX).unwrap().map(|i| i.unwrap().0).collect();
        assert_eq!(keys, (10..20u64).chain(std::iter::once(100)).collect::<Vec<_>>());
        handle.shutdown();
    }

    #[test]
    fn backpressure_with_single_worker() {
        let file = NamedTempFile::new().unwrap();
        // One worker and a tiny waiting queue force RETRY responses, which
        // the client wrappers absorb transparently.
        let handle = spawn_server(&file, |config| config.max_cores(1).waiting_rpc_limit(1));
        let addr = handle.local_addr().to_string();

        let writers: Vec<_> = (0..2u64)
            .map(|client_id| {
                let addr = addr.clone();
                std::thread::spawn(move || {
                    let mut client = Client::connect(&addr).unwrap();
                    for seq in 0..64u64 {
                        let key = client_id * 1000 + seq;
                        client.put(key, &seq.to_le_bytes()).unwrap();
                    }
                    // Every response was paired with its request.
                    for seq in 0..64u64 {
                        let key = client_id * 1000 + seq;
                        assert_eq!(client.get(key).unwrap(), Some(seq.to_le_bytes().to_vec()));
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }
        handle.shutdown();
    }

    #[test]
    fn unknown_opcode_gets_unimplemented_status() {
        use std::io::{Read, Write};

        let file = NamedTempFile::new().unwrap();
        let handle = spawn_server(&file, |config| config);

        // Raw socket speaking just enough protocol to misbehave.
        let mut stream = std::net::TcpStream::connect(handle.local_addr()).unwrap();
        let mut request = Vec::new();
        request.extend_from_slice(&Header { nonce: 9, len: 10 }.encode());
        request.extend_from_slice(&999u16.to_le_bytes());
        request.extend_from_slice(&0u64.to_le_bytes());
        stream.write_all(&request).unwrap();

        let mut response = [0u8; HEADER_SIZE + 4];
        stream.read_exact(&mut response).unwrap();
        let header = Header::decode(&response[..HEADER_SIZE].try_into().unwrap());
        assert_eq!(header.nonce, 9);
        assert_eq!(header.len, 4);
        let status = u32::from_le_bytes(response[HEADER_SIZE..].try_into().unwrap());
        assert_eq!(status, Status::UnimplementedRequest as u32);

        handle.shutdown();
    }

    #[test]
    fn cancelled_request_leaves_session_usable() {
        use crate::buffer::Buffer;
        use crate::wire::Opcode;

        let file = NamedTempFile::new().unwrap();
        let handle = spawn_server(&file, |config| config);
        let mut client = connect(&handle);
        client.put(1, b"keep").unwrap();

        // Fire a GET and cancel before ever polling for its response.
        let mut request = Buffer::new();
        request.append(&(Opcode::Get as u16).to_le_bytes());
        request.append(&1u64.to_le_bytes());
        let pending = client.send_request(request);
        client.cancel_request(&pending);
        assert!(client.wait(&pending).is_err());

        // The stray response is read and discarded; the session still works.
        assert_eq!(client.get(1).unwrap(), Some(b"keep".to_vec()));
        handle.shutdown();
    }

    #[test]
    fn server_survives_abrupt_client_disconnect() {
        let file = NamedTempFile::new().unwrap();
        let handle = spawn_server(&file, |config| config);
        {
            let mut client = connect(&handle);
            client.put(1, b"here").unwrap();
            // Dropped with the connection open.
        }
        let mut client = connect(&handle);
        assert_eq!(client.get(1).unwrap(), Some(b"here".to_vec()));
        handle.shutdown();
    }
}
