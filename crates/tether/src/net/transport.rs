use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::runtime::Runtime;

use super::protocol::MAX_PACKET_SIZE;
use super::stats::{NetworkStats, PacketLossSimulation};

/// A datagram waiting for the next flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub bytes: Vec<u8>,
    pub from: SocketAddr,
}

type Inbound = Arc<Mutex<VecDeque<Datagram>>>;

/// One UDP socket. Datagrams are received by a background task into a
/// shared queue; [`Transport::flush`] hands them to the tick thread.
pub struct Transport {
    socket: Option<UdpSocket>,
    local_addr: SocketAddr,
    inbound: Inbound,
    runtime: Option<Runtime>,
    stats: NetworkStats,
    loss_sim: PacketLossSimulation,
}

impl Transport {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("tether-recv")
            .enable_all()
            .build()?;

        let inbound: Inbound = Arc::new(Mutex::new(VecDeque::new()));
        let recv_socket = {
            let _guard = runtime.enter();
            tokio::net::UdpSocket::from_std(socket.try_clone()?)?
        };
        runtime.spawn(receive_loop(recv_socket, Arc::clone(&inbound)));

        log::debug!("transport bound on {}", local_addr);

        Ok(Self {
            socket: Some(socket),
            local_addr,
            inbound,
            runtime: Some(runtime),
            stats: NetworkStats::default(),
            loss_sim: PacketLossSimulation::default(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut NetworkStats {
        &mut self.stats
    }

    pub fn set_packet_loss_sim(&mut self, sim: PacketLossSimulation) {
        self.loss_sim = sim;
    }

    /// Fire-and-forget send. Failures are logged and counted, never returned.
    pub fn send_to(&mut self, bytes: &[u8], addr: SocketAddr) {
        let Some(socket) = &self.socket else {
            log::debug!("send to {} on closed transport dropped", addr);
            return;
        };

        if self.loss_sim.should_drop() {
            self.stats.packets_dropped += 1;
            return;
        }

        match socket.send_to(bytes, addr) {
            Ok(sent) => {
                self.stats.packets_sent += 1;
                self.stats.bytes_sent += sent as u64;
            }
            Err(e) => {
                self.stats.send_errors += 1;
                if e.kind() == io::ErrorKind::WouldBlock {
                    log::debug!("send buffer full, dropped datagram to {}", addr);
                } else {
                    log::warn!("send to {} failed: {}", addr, e);
                }
            }
        }
    }

    /// Drains everything received since the previous flush.
    pub fn flush(&mut self) -> Vec<Datagram> {
        let drained: Vec<Datagram> = {
            let mut queue = self.inbound.lock().unwrap_or_else(PoisonError::into_inner);
            queue.drain(..).collect()
        };

        self.stats.packets_received += drained.len() as u64;
        self.stats.bytes_received += drained.iter().map(|d| d.bytes.len() as u64).sum::<u64>();
        drained
    }

    /// Stops the receive task and releases the socket. Safe to call twice.
    pub fn close(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
        if self.socket.take().is_some() {
            log::debug!("transport on {} closed", self.local_addr);
        }
        self.inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close();
    }
}

async fn receive_loop(socket: tokio::net::UdpSocket, inbound: Inbound) {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((size, from)) => {
                let datagram = Datagram {
                    bytes: buf[..size].to_vec(),
                    from,
                };
                inbound
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push_back(datagram);
            }
            // ICMP port unreachable from an earlier send surfaces here on some
            // platforms; the socket is still usable.
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
            Err(e) => {
                log::warn!("receive failed: {}", e);
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        }
    }
}
