//! 单线程 I/O 循环
//!
//! 一个 UDP DNS 套接字、一个 TCP 监听套接字，加上任意数量的 HTTP 连接，全部
//! 由一次 `poll` 驱动。每一轮：
//!
//! 1. 按连接当前是否有待写任务登记读/写兴趣，等待就绪；
//! 2. 监听套接字可读时接受一个新连接；
//! 3. DNS 套接字可读时应答一个查询；
//! 4. 可读的连接读取一次请求并生成写任务；
//! 5. 可写的连接推进一个块，写完即关闭。

use std::io::{self, Read};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::os::fd::AsRawFd;
use std::time::Duration;

use anyhow::Context;
use log::Level;

use super::content::WebRoot;
use super::dns::DnsQuery;
use super::html::Templates;
use super::http::{classify, Request};
use super::poller::{Interest, Poller};
use super::slab::Slab;
use super::streamer::{advance, WriteTask};
use crate::setting::Setting;

const DNS_BUF_SIZE: usize = 1024;
const REQUEST_BUF_SIZE: usize = 4096;

struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    /// 有任务时等待可写，否则等待请求
    task: Option<WriteTask>,
}

impl Connection {
    fn interest(&self) -> Interest {
        if self.task.is_some() {
            Interest::WRITE
        } else {
            Interest::READ
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub turns: u64,
    pub accepted: u64,
    pub closed: u64,
    pub dns_answered: u64,
}

pub struct Reactor<'a, R: WebRoot> {
    setting: &'a Setting,
    ip: Ipv4Addr,
    root: R,
    templates: Templates,
    listener: TcpListener,
    dns: UdpSocket,
    connections: Slab<Connection>,
    poller: Poller,
    timeout: Option<Duration>,
    stats: Stats,
}

impl<'a, R: WebRoot> Reactor<'a, R> {
    /// 绑定 DNS 与 HTTP 端口；`ip` 是 DNS 应答里返回的地址
    pub fn bind(setting: &'a Setting, ip: Ipv4Addr, root: R) -> anyhow::Result<Self> {
        let templates = Templates::new(setting)?;

        let dns = UdpSocket::bind((setting.bind_address, setting.dns_port))
            .with_context(|| format!("Failed to bind DNS socket on port {}", setting.dns_port))?;
        dns.set_nonblocking(true)?;
        log::info!("DNS Server: Listening {}:{}", ip, dns.local_addr()?.port());

        let listener = TcpListener::bind((setting.bind_address, setting.http_port))
            .with_context(|| format!("Failed to bind web server on port {}", setting.http_port))?;
        listener.set_nonblocking(true)?;
        log::info!(
            "Web Server: Listening http://{}:{}/",
            ip,
            listener.local_addr()?.port()
        );

        Ok(Self {
            setting,
            ip,
            root,
            templates,
            listener,
            dns,
            connections: Slab::new(),
            poller: Poller::new(),
            timeout: setting.poll_timeout_ms.map(Duration::from_millis),
            stats: Stats::default(),
        })
    }

    pub fn dns_addr(&self) -> io::Result<SocketAddr> {
        self.dns.local_addr()
    }

    pub fn http_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    /// 不会正常返回；只有 poll 失败这类致命错误才会退出
    pub fn run(&mut self) -> anyhow::Result<()> {
        loop {
            self.turn()?;
        }
    }

    pub fn turn(&mut self) -> anyhow::Result<()> {
        self.stats.turns += 1;

        self.poller.clear();
        let listener = self
            .poller
            .register(self.listener.as_raw_fd(), Interest::READ);
        let dns = self.poller.register(self.dns.as_raw_fd(), Interest::READ);
        let watched: Vec<(usize, usize)> = self
            .connections
            .iter()
            .map(|(key, conn)| {
                (
                    key,
                    self.poller.register(conn.stream.as_raw_fd(), conn.interest()),
                )
            })
            .collect();

        let ready = self.poller.wait(self.timeout).context("poll failed")?;
        log::trace!(
            "sockets: ready {} watched {} open {} stats {:?}",
            ready,
            self.poller.len(),
            self.connections.len(),
            self.stats
        );
        if ready == 0 {
            return Ok(());
        }

        if self.poller.readiness(listener).readable {
            self.accept();
        }
        if self.poller.readiness(dns).readable {
            self.answer_dns();
        }

        let mut writable = Vec::new();
        for (key, index) in watched {
            let readiness = self.poller.readiness(index);
            if readiness.error {
                self.close(key, "socket error");
            } else if readiness.readable {
                self.read_request(key);
            } else if readiness.writable {
                writable.push(key);
            }
        }

        for key in writable {
            self.write_response(key);
        }

        Ok(())
    }

    fn dns_level(&self) -> Level {
        if self.setting.log_dns {
            Level::Info
        } else {
            Level::Debug
        }
    }

    fn http_level(&self) -> Level {
        if self.setting.log_http {
            Level::Info
        } else {
            Level::Debug
        }
    }

    fn accept(&mut self) {
        match self.listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nonblocking(true) {
                    log::warn!("Web: failed to set {} non-blocking: {}", peer, e);
                    return;
                }
                let key = self.connections.insert(Connection {
                    stream,
                    peer,
                    task: None,
                });
                self.stats.accepted += 1;
                log::log!(self.http_level(), "Web: incoming client {} (#{})", peer, key);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => log::warn!("Web: accept failed: {}", e),
        }
    }

    fn answer_dns(&mut self) {
        let mut buf = [0u8; DNS_BUF_SIZE];
        let (len, peer) = match self.dns.recv_from(&mut buf) {
            Ok(r) => r,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                log::warn!("DNS: recv failed: {}", e);
                return;
            }
        };

        let query = match DnsQuery::parse(&buf[..len]) {
            Ok(query) => query,
            Err(e) => {
                log::debug!("DNS: dropping query from {}: {}", peer, e);
                return;
            }
        };

        let answer = query.build_answer(self.ip);
        if answer.is_empty() {
            log::debug!("DNS: ignoring non-standard query from {}", peer);
            return;
        }

        match self.dns.send_to(&answer, peer) {
            Ok(_) => {
                self.stats.dns_answered += 1;
                log::log!(
                    self.dns_level(),
                    "DNS: redirect {} -> {}",
                    query.domain,
                    self.ip
                );
            }
            Err(e) => log::warn!("DNS: send to {} failed: {}", peer, e),
        }
    }

    fn read_request(&mut self, key: usize) {
        let mut buf = [0u8; REQUEST_BUF_SIZE];
        let read = match self.connections.get_mut(key) {
            Some(conn) => conn.stream.read(&mut buf),
            None => return,
        };

        let len = match read {
            Ok(0) => {
                self.close(key, "peer closed");
                return;
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => 0,
            Err(e) => {
                log::debug!("Web: read failed: {}", e);
                self.close(key, "read error");
                return;
            }
        };

        let request = Request::parse(&buf[..len]);
        let accepted = self.setting.is_accepted(&request.normalized_host());
        log::log!(
            self.http_level(),
            "Web: {} {}{}",
            if accepted { "serving" } else { "redirecting" },
            request.host,
            request.path
        );
        let task = classify(&request, &self.templates, self.setting, &self.root);

        if let Some(conn) = self.connections.get_mut(key) {
            conn.task = Some(task);
        }
    }

    fn write_response(&mut self, key: usize) {
        let result = match self.connections.get_mut(key) {
            Some(conn) => match conn.task.take() {
                Some(task) => advance(task, &mut conn.stream),
                None => return,
            },
            None => return,
        };

        match result {
            Ok(step) => match step.next {
                Some(next) => {
                    if let Some(conn) = self.connections.get_mut(key) {
                        conn.task = Some(next);
                    }
                }
                None => self.close(key, "response complete"),
            },
            Err(e) => {
                log::debug!("Web: write failed: {}", e);
                self.close(key, "write error");
            }
        }
    }

    fn close(&mut self, key: usize, reason: &str) {
        if let Some(conn) = self.connections.remove(key) {
            self.stats.closed += 1;
            log::debug!("Web: closing {} (#{}): {}", conn.peer, key, reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::net::Shutdown;

    use super::*;
    use crate::captive_portal::content::DiskRoot;
    use crate::captive_portal::streamer::CHUNK_SIZE;

    fn test_setting() -> Setting {
        Setting {
            bind_address: Ipv4Addr::LOCALHOST,
            dns_port: 0,
            http_port: 0,
            poll_timeout_ms: Some(20),
            ..Default::default()
        }
        .normalized()
        .unwrap()
    }

    fn dns_query(id: u16, name: &[&str]) -> Vec<u8> {
        let mut data = id.to_be_bytes().to_vec();
        data.extend_from_slice(&[0x01, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
        for label in name {
            data.push(label.len() as u8);
            data.extend_from_slice(label.as_bytes());
        }
        data.extend_from_slice(&[0, 0x00, 0x01, 0x00, 0x01]);
        data
    }

    /// 非阻塞地读出当前可读的数据；对端关闭时返回 true
    fn pump(stream: &mut TcpStream, out: &mut Vec<u8>) -> bool {
        let mut buf = [0u8; 8192];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => return true,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return false,
                Err(e) => panic!("client read failed: {e}"),
            }
        }
    }

    fn client(reactor: &Reactor<'_, DiskRoot>, request: &[u8]) -> TcpStream {
        let mut stream = TcpStream::connect(reactor.http_addr().unwrap()).unwrap();
        stream.write_all(request).unwrap();
        stream.set_nonblocking(true).unwrap();
        stream
    }

    #[test]
    fn test_dns_answers_with_device_ip() {
        let setting = test_setting();
        let dir = tempfile::tempdir().unwrap();
        let ip = Ipv4Addr::new(192, 168, 4, 1);
        let mut reactor = Reactor::bind(&setting, ip, DiskRoot::new(dir.path())).unwrap();

        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let server = reactor.dns_addr().unwrap();

        // 垃圾报文直接丢弃
        socket.send_to(&[0x12, 0x34, 0x01], server).unwrap();
        reactor.turn().unwrap();

        let query = dns_query(0x1234, &["captive", "apple", "com"]);
        socket.send_to(&query, server).unwrap();
        for _ in 0..10 {
            reactor.turn().unwrap();
            if reactor.stats().dns_answered == 1 {
                break;
            }
        }

        let mut buf = [0u8; 512];
        let (len, _) = socket.recv_from(&mut buf).unwrap();
        let answer = &buf[..len];
        assert_eq!(&answer[..2], &[0x12, 0x34]);
        assert_eq!(&answer[len - 4..], &[192, 168, 4, 1]);
        assert_eq!(len, query.len() + 16);
        assert_eq!(reactor.stats().dns_answered, 1);
    }

    #[test]
    fn test_concurrent_downloads_complete() {
        let setting = test_setting();
        let dir = tempfile::tempdir().unwrap();
        let big: Vec<u8> = (0..50_000u32).map(|i| (i % 253) as u8).collect();
        let index = b"<html><body>QR Games</body></html>".to_vec();
        std::fs::write(dir.path().join("big.bin"), &big).unwrap();
        std::fs::write(dir.path().join("index.html"), &index).unwrap();

        let mut reactor =
            Reactor::bind(&setting, Ipv4Addr::LOCALHOST, DiskRoot::new(dir.path())).unwrap();
        let ok_header = reactor.templates.ok_header.to_vec();

        let mut clients = vec![
            (
                client(
                    &reactor,
                    b"GET /big.bin HTTP/1.1\r\nHost: test.qrpr.eu\r\n\r\n",
                ),
                Vec::new(),
                false,
            ),
            (
                client(
                    &reactor,
                    b"GET /missing HTTP/1.1\r\nHost: test.qrpr.eu\r\n\r\n",
                ),
                Vec::new(),
                false,
            ),
        ];

        for _ in 0..2000 {
            reactor.turn().unwrap();
            for (stream, out, done) in clients.iter_mut() {
                if !*done {
                    *done = pump(stream, out);
                }
            }
            if clients.iter().all(|(_, _, done)| *done) {
                break;
            }
        }

        let mut expected_big = ok_header.clone();
        expected_big.extend_from_slice(&big);
        let mut expected_index = ok_header;
        expected_index.extend_from_slice(&index);

        assert!(clients[0].2 && clients[1].2);
        assert_eq!(clients[0].1, expected_big);
        assert_eq!(clients[1].1, expected_index);

        assert_eq!(reactor.connection_count(), 0);
        let stats = reactor.stats();
        assert_eq!(stats.accepted, 2);
        assert_eq!(stats.closed, 2);
    }

    #[test]
    fn test_unknown_host_redirected_and_closed() {
        let setting = test_setting();
        let dir = tempfile::tempdir().unwrap();
        let mut reactor =
            Reactor::bind(&setting, Ipv4Addr::LOCALHOST, DiskRoot::new(dir.path())).unwrap();

        let mut stream = client(
            &reactor,
            b"GET /hotspot-detect.html HTTP/1.0\r\nHost: evil.example\r\n\r\n",
        );
        let mut out = Vec::new();
        let mut done = false;
        for _ in 0..200 {
            reactor.turn().unwrap();
            done = pump(&mut stream, &mut out);
            if done {
                break;
            }
        }

        assert!(done);
        assert_eq!(out, reactor.templates.redirect.to_vec());
        assert_eq!(reactor.connection_count(), 0);
        assert_eq!(reactor.stats().closed, 1);
    }

    #[test]
    fn test_peer_closing_early_is_cleaned_up() {
        let setting = test_setting();
        let dir = tempfile::tempdir().unwrap();
        let mut reactor =
            Reactor::bind(&setting, Ipv4Addr::LOCALHOST, DiskRoot::new(dir.path())).unwrap();

        let stream = TcpStream::connect(reactor.http_addr().unwrap()).unwrap();
        stream.shutdown(Shutdown::Both).unwrap();
        drop(stream);

        for _ in 0..200 {
            reactor.turn().unwrap();
            if reactor.stats().closed == 1 {
                break;
            }
        }

        let stats = reactor.stats();
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.closed, 1);
        assert_eq!(reactor.connection_count(), 0);
    }

    /// 关闭时发送 RST 而不是 FIN
    fn reset_on_drop(stream: &TcpStream) {
        let linger = libc::linger {
            l_onoff: 1,
            l_linger: 0,
        };
        let rc = unsafe {
            libc::setsockopt(
                stream.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_LINGER,
                &linger as *const libc::linger as *const libc::c_void,
                std::mem::size_of::<libc::linger>() as libc::socklen_t,
            )
        };
        assert_eq!(rc, 0, "{}", io::Error::last_os_error());
    }

    #[test]
    fn test_reset_mid_download_is_closed() {
        let setting = test_setting();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("big.bin"), vec![7u8; 8 * 1024 * 1024]).unwrap();
        let mut reactor =
            Reactor::bind(&setting, Ipv4Addr::LOCALHOST, DiskRoot::new(dir.path())).unwrap();

        // 客户端不读，让服务端一直处于写状态
        let stream = client(
            &reactor,
            b"GET /big.bin HTTP/1.1\r\nHost: test.qrpr.eu\r\n\r\n",
        );
        for _ in 0..5 {
            reactor.turn().unwrap();
        }
        assert_eq!(reactor.connection_count(), 1);
        assert_eq!(reactor.stats().closed, 0);

        reset_on_drop(&stream);
        drop(stream);

        for _ in 0..200 {
            reactor.turn().unwrap();
            if reactor.stats().closed == 1 {
                break;
            }
        }

        let stats = reactor.stats();
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.closed, 1);
        assert_eq!(reactor.connection_count(), 0);
    }

    #[test]
    fn test_one_chunk_per_connection_per_turn() {
        let setting = test_setting();
        let dir = tempfile::tempdir().unwrap();
        let body: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(dir.path().join("game.bin"), &body).unwrap();
        let mut reactor =
            Reactor::bind(&setting, Ipv4Addr::LOCALHOST, DiskRoot::new(dir.path())).unwrap();
        let header_len = reactor.templates.ok_header.len();

        let request = b"GET /game.bin HTTP/1.1\r\nHost: test.qrpr.eu\r\n\r\n";
        let mut clients = vec![
            (client(&reactor, request), Vec::new(), Vec::new(), false),
            (client(&reactor, request), Vec::new(), Vec::new(), false),
        ];

        for _ in 0..2000 {
            reactor.turn().unwrap();
            for (stream, out, per_turn, done) in clients.iter_mut() {
                if *done {
                    continue;
                }
                let before = out.len();
                *done = pump(stream, out);
                if out.len() > before {
                    per_turn.push(out.len() - before);
                }
            }
            if clients.iter().all(|c| c.3) {
                break;
            }
        }

        let mut expected = reactor.templates.ok_header.to_vec();
        expected.extend_from_slice(&body);
        for (_, out, per_turn, done) in &clients {
            assert!(*done);
            assert_eq!(out, &expected);
            assert!(per_turn[0] <= header_len + CHUNK_SIZE, "{per_turn:?}");
            assert!(per_turn[1..].iter().all(|&n| n <= CHUNK_SIZE), "{per_turn:?}");
            assert!(per_turn.len() >= body.len().div_ceil(CHUNK_SIZE));
        }
    }

    #[test]
    fn test_one_accept_per_turn() {
        let setting = test_setting();
        let dir = tempfile::tempdir().unwrap();
        let mut reactor =
            Reactor::bind(&setting, Ipv4Addr::LOCALHOST, DiskRoot::new(dir.path())).unwrap();

        let _a = TcpStream::connect(reactor.http_addr().unwrap()).unwrap();
        let _b = TcpStream::connect(reactor.http_addr().unwrap()).unwrap();

        reactor.turn().unwrap();
        assert_eq!(reactor.stats().accepted, 1);
        assert_eq!(reactor.connection_count(), 1);

        reactor.turn().unwrap();
        assert_eq!(reactor.stats().accepted, 2);
        assert_eq!(reactor.connection_count(), 2);
    }

    #[test]
    fn test_bind_without_hosts_fails() {
        let setting = Setting {
            accepted_hosts: Vec::new(),
            ..test_setting()
        };
        let dir = tempfile::tempdir().unwrap();
        assert!(Reactor::bind(&setting, Ipv4Addr::LOCALHOST, DiskRoot::new(dir.path())).is_err());
    }
}
