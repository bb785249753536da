//! Face over UDP multicast: every node on the segment hears every packet.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use ndnkit_core::face::{ResponseCallback, TimeoutCallback};
use ndnkit_core::{
    decode_packet, encode_packet, CancelToken, Error, Face, FaceTable, Name, Packet, Request,
    RequestHandler, Response, Result, MAX_DATAGRAM,
};
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Multicast face. Received packets queue up until the next `pump()`.
pub struct UdpFace {
    socket: Arc<UdpSocket>,
    dest: SocketAddr,
    started: Instant,
    table: Mutex<FaceTable>,
    inbound: Mutex<mpsc::UnboundedReceiver<Packet>>,
    recv_task: JoinHandle<()>,
}

impl UdpFace {
    /// Bind `port`, join `group` and start receiving. Needs a tokio runtime.
    pub async fn bind(port: u16, group: &str) -> std::io::Result<Self> {
        let multicast: Ipv4Addr = group
            .parse()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        let socket = Arc::new(make_multicast_socket(port, multicast)?);
        let (tx, rx) = mpsc::unbounded_channel();
        let recv_task = tokio::spawn(recv_loop(socket.clone(), tx));
        Ok(Self {
            socket,
            dest: SocketAddr::from((multicast, port)),
            started: Instant::now(),
            table: Mutex::new(FaceTable::new()),
            inbound: Mutex::new(rx),
            recv_task,
        })
    }

    fn send_packet(&self, packet: &Packet) -> Result<()> {
        let datagram = encode_packet(packet).map_err(|e| Error::Transport(e.to_string()))?;
        match self.socket.try_send_to(&datagram, self.dest) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                warn!("socket busy, packet dropped");
                Ok(())
            }
            Err(e) => Err(Error::Transport(e.to_string())),
        }
    }

    fn on_request(&self, request: Request) -> Result<()> {
        let handlers = self.table.lock().providers_for(&request.name);
        for handler in handlers {
            if let Some(response) = handler(&request) {
                if request.accepts(&response.name) {
                    self.put(response)?;
                }
            }
        }
        Ok(())
    }
}

impl Drop for UdpFace {
    fn drop(&mut self) {
        self.recv_task.abort();
    }
}

impl Face for UdpFace {
    fn send_request(
        &self,
        request: Request,
        on_response: ResponseCallback,
        on_timeout: TimeoutCallback,
    ) -> Result<CancelToken> {
        self.send_packet(&Packet::Request(request.clone()))?;
        let now = self.started.elapsed();
        Ok(self.table.lock().add_pending(request, now, on_response, on_timeout))
    }

    fn register_provider(&self, prefix: Name, on_request: RequestHandler) -> Result<CancelToken> {
        Ok(self.table.lock().add_provider(prefix, on_request))
    }

    fn put(&self, response: Response) -> Result<()> {
        self.table.lock().satisfy(&response);
        self.send_packet(&Packet::Response(response))
    }

    fn pump(&self) -> Result<()> {
        let packets: Vec<Packet> = {
            let mut rx = self.inbound.lock();
            std::iter::from_fn(|| rx.try_recv().ok()).collect()
        };
        for packet in packets {
            match packet {
                Packet::Request(request) => self.on_request(request)?,
                Packet::Response(response) => {
                    self.table.lock().satisfy(&response);
                }
            }
        }
        let ready = {
            let mut table = self.table.lock();
            table.expire(self.started.elapsed());
            table.take_ready()
        };
        for delivery in ready {
            delivery.run();
        }
        Ok(())
    }
}

fn make_multicast_socket(port: u16, multicast: Ipv4Addr) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind(("0.0.0.0", port))?;
    std_sock.join_multicast_v4(&multicast, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_multicast_loop_v4(true)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

async fn recv_loop(socket: Arc<UdpSocket>, tx: mpsc::UnboundedSender<Packet>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, from)) => match decode_packet(&buf[..n]) {
                Ok(packet) => {
                    if tx.send(packet).is_err() {
                        return;
                    }
                }
                Err(e) => debug!(%from, error = %e, "dropping undecodable datagram"),
            },
            Err(e) => {
                warn!(error = %e, "multicast receive failed");
                return;
            }
        }
    }
}
