//! Test transports standing in for real bus wiring.
//!
//! [`SimBus`] joins several arbiters to an in-process wired-OR bus with a
//! deterministic tick scheduler and optional fault injection; the
//! conformance tests run on it.
//!
//! [`BusHub`] and [`BusPort`] do the same across process boundaries over
//! a Unix domain socket: every client sends one byte whenever its drive
//! state changes, the hub ORs all contributions and broadcasts the result,
//! so separately running programs see a shared bus.

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::bus::arbiter::{Arbiter, BusConfig, Wire};
use crate::core::Result;

struct SimState {
    drives: Vec<u8>,
    /// snapshot all nodes sense during the current tick
    sensed: u8,
    fault_rate: f64,
    wire_mask: u8,
}

/// One node's attachment to a [`SimBus`]
pub struct SimWire {
    state: Rc<RefCell<SimState>>,
    idx: usize,
}

impl Wire for SimWire {
    fn sense(&self) -> u8 {
        self.state.borrow().sensed
    }
    fn drive(&mut self, bits: u8) {
        self.state.borrow_mut().drives[self.idx] = bits;
    }
}

/// Deterministic in-process wired-OR bus.
///
/// All nodes sense the same snapshot per tick, taken before any node
/// runs, so node ordering cannot influence the outcome. With a nonzero
/// fault rate a random wire bit is flipped in some snapshots, which the
/// frame CRCs have to catch.
pub struct SimBus {
    state: Rc<RefCell<SimState>>,
    nodes: Vec<Arbiter<SimWire>>,
}

impl SimBus {
    pub fn new(cfg: BusConfig, node_count: usize) -> Result<Self> {
        let wire_mask = (1u8 << cfg.wires) - 1;
        let state = Rc::new(RefCell::new(SimState {
            drives: vec![0; node_count],
            sensed: 0,
            fault_rate: 0.0,
            wire_mask,
        }));
        let nodes = (0..node_count)
            .map(|idx| {
                Arbiter::new(cfg.clone(), SimWire { state: state.clone(), idx })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(SimBus { state, nodes })
    }

    /// Flips one random wire bit in roughly `rate` of all tick snapshots
    pub fn with_fault_rate(self, rate: f64) -> Self {
        self.state.borrow_mut().fault_rate = rate;
        self
    }

    pub fn node(&mut self, idx: usize) -> &mut Arbiter<SimWire> {
        &mut self.nodes[idx]
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Takes the snapshot, then advances every node by one tick
    pub fn tick(&mut self) {
        {
            let mut st = self.state.borrow_mut();
            let mut sensed = st.drives.iter().fold(0, |a, b| a | b);
            if st.fault_rate > 0.0 {
                let mut rng = rand::thread_rng();
                if rng.gen_bool(st.fault_rate) {
                    let bit = rng.gen_range(0..st.wire_mask.count_ones());
                    sensed ^= 1 << bit;
                    trace!(sensed, "injected wire fault");
                }
            }
            st.sensed = sensed & st.wire_mask;
        }
        for node in &mut self.nodes {
            node.tick();
        }
    }

    pub fn run(&mut self, ticks: usize) {
        for _ in 0..ticks {
            self.tick();
        }
    }
}

struct HubState {
    drives: Vec<u8>,
    bus: u8,
}

/// Unix-socket hub emulating the shared wires for multiple processes
pub struct BusHub {
    listener: UnixListener,
    state: Arc<Mutex<HubState>>,
    changes: broadcast::Sender<u8>,
}

impl BusHub {
    /// Binds the hub socket
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        let listener = UnixListener::bind(path)?;
        let (changes, _) = broadcast::channel(64);
        Ok(BusHub {
            listener,
            state: Arc::new(Mutex::new(HubState { drives: Vec::new(), bus: 0 })),
            changes,
        })
    }

    /// Accepts clients until the task is aborted
    pub async fn run(self) -> Result<()> {
        loop {
            let (stream, _) = self.listener.accept().await?;
            let id = {
                let mut st = self.state.lock().await;
                st.drives.push(0);
                st.drives.len() - 1
            };
            debug!(id, "bus client connected");
            let state = self.state.clone();
            let changes = self.changes.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_client(stream, id, state, changes).await {
                    debug!(id, error = %e, "bus client gone");
                }
            });
        }
    }
}

async fn serve_client(
    stream: UnixStream,
    id: usize,
    state: Arc<Mutex<HubState>>,
    changes: broadcast::Sender<u8>,
) -> Result<()> {
    let (mut rd, mut wr) = stream.into_split();
    let mut rx = changes.subscribe();

    // the newcomer needs the current bus state before any change arrives
    let bus = state.lock().await.bus;
    wr.write_all(&[bus]).await?;

    let writer = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(bus) => {
                    if wr.write_all(&[bus]).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "bus client lagging");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut buf = [0u8; 1];
    let result = loop {
        match rd.read_exact(&mut buf).await {
            Ok(_) => {
                let mut st = state.lock().await;
                st.drives[id] = buf[0];
                let bus = st.drives.iter().fold(0, |a, b| a | b);
                if bus != st.bus {
                    st.bus = bus;
                    let _ = changes.send(bus);
                }
            }
            Err(e) => break Err(e.into()),
        }
    };

    // release this client's contribution
    {
        let mut st = state.lock().await;
        st.drives[id] = 0;
        let bus = st.drives.iter().fold(0, |a, b| a | b);
        if bus != st.bus {
            st.bus = bus;
            let _ = changes.send(bus);
        }
    }
    writer.abort();
    result
}

/// Client end of a [`BusHub`].
///
/// Implements [`Wire`], so an [`Arbiter`] can sit directly on top: the
/// sensed state is the last byte the hub broadcast, drive changes go out
/// as single bytes.
pub struct BusPort {
    sensed: Arc<AtomicU8>,
    drive_tx: mpsc::UnboundedSender<u8>,
    last_drive: u8,
    io: JoinHandle<()>,
}

impl BusPort {
    /// Connects to a hub socket and spawns the IO task
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let stream = UnixStream::connect(path).await?;
        let (mut rd, mut wr) = stream.into_split();
        let sensed = Arc::new(AtomicU8::new(0));
        let (drive_tx, mut drive_rx) = mpsc::unbounded_channel::<u8>();

        let sensed2 = sensed.clone();
        let io = tokio::spawn(async move {
            let mut buf = [0u8; 1];
            loop {
                tokio::select! {
                    r = rd.read_exact(&mut buf) => {
                        match r {
                            Ok(_) => sensed2.store(buf[0], Ordering::SeqCst),
                            Err(_) => break,
                        }
                    }
                    d = drive_rx.recv() => {
                        match d {
                            Some(bits) => {
                                if wr.write_all(&[bits]).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
        });

        Ok(BusPort { sensed, drive_tx, last_drive: 0, io })
    }
}

impl Wire for BusPort {
    fn sense(&self) -> u8 {
        self.sensed.load(Ordering::SeqCst)
    }
    fn drive(&mut self, bits: u8) {
        if bits != self.last_drive {
            self.last_drive = bits;
            let _ = self.drive_tx.send(bits);
        }
    }
}

impl Drop for BusPort {
    fn drop(&mut self) {
        self.io.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::arbiter::BusEvent;
    use crate::bus::negotiator::{AddrClient, AddrConfig, AddrServer};
    use crate::core::{Addr, Priority, Serial};
    use crate::protocol::message::Message;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    fn make_msg(src: i8, dst: i8, code: u8, data: &[u8]) -> Message {
        let mut m = Message::new(64);
        m.set_header(Addr(src), Addr(dst), code).unwrap();
        m.start_send().unwrap();
        m.append_bytes(data).unwrap();
        m
    }

    #[test]
    fn test_end_to_end_over_sim_bus() {
        let mut bus = SimBus::new(BusConfig::default(), 2).unwrap();
        bus.node(0).send(make_msg(-1, -2, 2, &[0xDE, 0xAD]), Priority::new(1));

        for _ in 0..600 {
            bus.tick();
            if let Some(BusEvent::Received(m, _)) = bus.node(1).poll_event() {
                assert_eq!(m.src(), Addr(-1));
                assert_eq!(m.dst(), Addr(-2));
                assert_eq!(m.code(), 2);
                assert_eq!(m.data(), &[0xDE, 0xAD]);
                return;
            }
        }
        panic!("frame never arrived");
    }

    #[test]
    fn test_faults_never_corrupt_silently() {
        // with injected wire faults frames may be lost, but whatever gets
        // through must be intact
        let mut bus = SimBus::new(BusConfig::default(), 2).unwrap().with_fault_rate(0.02);
        // long enough for the 11-bit frame CRC
        let payload = [0x11u8, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88];

        let mut delivered = 0;
        for round in 0..30u8 {
            bus.node(0)
                .send(make_msg(3, 4, 7, &payload), Priority::new(round % 4));
            for _ in 0..2000 {
                bus.tick();
                if let Some(BusEvent::Received(m, _)) = bus.node(1).poll_event() {
                    assert_eq!(m.data(), &payload, "corrupted frame slipped through");
                    delivered += 1;
                }
                while bus.node(0).poll_event().is_some() {}
            }
        }
        assert!(delivered > 0, "nothing survived a 2% fault rate");
    }

    /// Glue for the convergence test: every client node forwards bus
    /// traffic into its negotiator and queues whatever it wants sent.
    #[test]
    fn test_address_convergence_on_shared_bus() {
        init_tracing();
        let n_clients = 3;
        let mut bus = SimBus::new(BusConfig::default(), n_clients + 1).unwrap();
        let mut server = AddrServer::new(Addr::server(1), None).unwrap();
        let mut clients: Vec<AddrClient> = (0..n_clients)
            .map(|i| {
                AddrClient::new(
                    AddrConfig::default(),
                    Serial::new(vec![b'n', i as u8]).unwrap(),
                )
            })
            .collect();

        for _ in 0..400_000 {
            bus.tick();

            // server node is bus node 0
            while let Some(ev) = bus.node(0).poll_event() {
                if let BusEvent::Received(msg, _) = ev {
                    if let Some(reply) = server.handle(&msg).unwrap() {
                        bus.node(0).send(reply, Priority::new(0));
                    }
                }
            }

            for (i, client) in clients.iter_mut().enumerate() {
                let node = i + 1;
                if let Some(req) = client.tick() {
                    bus.node(node).send(req, Priority::new(0));
                }
                while let Some(ev) = bus.node(node).poll_event() {
                    if let BusEvent::Received(msg, _) = ev {
                        if let Some(out) = client.handle(&msg).unwrap() {
                            bus.node(node).send(out, Priority::new(0));
                        }
                    }
                }
            }

            if clients.iter().all(|c| c.addr().is_some()) {
                let mut addrs: Vec<_> = clients.iter().map(|c| c.addr().unwrap()).collect();
                addrs.sort_by_key(|a| a.0);
                addrs.dedup();
                assert_eq!(addrs.len(), n_clients, "duplicate addresses handed out");
                return;
            }
        }
        panic!(
            "nodes never converged: {:?}",
            clients.iter().map(|c| c.addr()).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn test_hub_ors_client_drives() {
        let path = std::env::temp_dir().join(format!(
            "wirebus-hub-{}.sock",
            rand::thread_rng().gen::<u32>()
        ));
        let hub = BusHub::bind(&path).unwrap();
        let hub_task = tokio::spawn(hub.run());

        let mut a = BusPort::connect(&path).await.unwrap();
        let mut b = BusPort::connect(&path).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        a.drive(0x01);
        b.drive(0x04);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(a.sense(), 0x05);
        assert_eq!(b.sense(), 0x05);

        a.drive(0x00);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(a.sense(), 0x04);
        assert_eq!(b.sense(), 0x04);

        hub_task.abort();
        let _ = std::fs::remove_file(&path);
    }
}
