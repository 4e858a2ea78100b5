//! Timer behavior through a running loop: one-shot firing, cancellation,
//! refresh extension, and idle-timeout collection of quiet connections.
//!
//! These tests are wall-clock driven (the wheel ticks once per second), so
//! the assertions use generous margins around the tick boundaries.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use spindle::{Config, EventLoop, LoopHandle, TcpServer};

fn spawn_loop() -> (LoopHandle, thread::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel();
    let join = thread::spawn(move || {
        let lp = EventLoop::new().unwrap();
        tx.send(lp.handle()).unwrap();
        lp.start().unwrap();
    });
    (rx.recv().unwrap(), join)
}

#[test]
fn one_shot_timer_fires_once() {
    let (handle, join) = spawn_loop();
    let fired = Arc::new(AtomicUsize::new(0));
    {
        let fired = fired.clone();
        handle
            .run_after(1, 1, move || {
                fired.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }

    thread::sleep(Duration::from_millis(2500));
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    handle.quit();
    join.join().unwrap();
}

#[test]
fn removed_timer_never_fires() {
    let (handle, join) = spawn_loop();
    let fired = Arc::new(AtomicUsize::new(0));
    {
        let fired = fired.clone();
        handle
            .run_after(1, 2, move || {
                fired.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }
    thread::sleep(Duration::from_millis(300));
    handle.remove_after(1);

    thread::sleep(Duration::from_millis(3000));
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    handle.quit();
    join.join().unwrap();
}

#[test]
fn refresh_from_a_foreign_thread_extends_the_deadline() {
    let (handle, join) = spawn_loop();
    let fired = Arc::new(AtomicUsize::new(0));
    let armed_at = Instant::now();
    {
        let fired = fired.clone();
        handle
            .run_after(1, 3, move || {
                fired.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }

    // Refresh mid-interval, away from a tick boundary.
    thread::sleep(Duration::from_millis(1500));
    handle.refresh_after(1);

    // The original placement expires three ticks after arming; the clone
    // made by the refresh keeps the task alive past that.
    thread::sleep(Duration::from_millis(2000));
    assert!(armed_at.elapsed() >= Duration::from_millis(3200));
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    // And the refreshed placement does expire.
    thread::sleep(Duration::from_millis(2000));
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    handle.quit();
    join.join().unwrap();
}

#[test]
fn out_of_range_timeouts_are_rejected() {
    let (handle, join) = spawn_loop();
    assert!(handle.run_after(1, 0, || {}).is_err());
    assert!(handle.run_after(1, 60, || {}).is_err());
    assert!(handle.run_after(1, 1, || {}).is_ok());
    handle.quit();
    join.join().unwrap();
}

struct IdleServer {
    addr: SocketAddr,
    handle: LoopHandle,
    closed: Arc<AtomicUsize>,
    join: thread::JoinHandle<()>,
}

fn spawn_idle_server(idle_secs: u64) -> IdleServer {
    let (tx, rx) = mpsc::channel();
    let closed = Arc::new(AtomicUsize::new(0));
    let closed2 = closed.clone();
    let join = thread::spawn(move || {
        let lp = EventLoop::new().unwrap();
        let config = Config {
            idle_timeout_secs: Some(idle_secs),
            ..Config::default()
        };
        let server = TcpServer::bind(&lp, "127.0.0.1:0".parse().unwrap(), config).unwrap();
        server.set_message_callback(|conn, input| {
            while let Some(line) = input.read_line() {
                conn.send(&line);
            }
        });
        server.set_close_callback(move |_conn| {
            closed2.fetch_add(1, Ordering::SeqCst);
        });
        server.start();
        tx.send((server.local_addr().unwrap(), lp.handle())).unwrap();
        lp.start().unwrap();
    });
    let (addr, handle) = rx.recv().unwrap();
    IdleServer {
        addr,
        handle,
        closed,
        join,
    }
}

#[test]
fn quiet_connection_is_collected() {
    let server = spawn_idle_server(2);
    let mut client = TcpStream::connect(server.addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(6)))
        .unwrap();

    // Send nothing: the server should close us within the idle window
    // (plus one tick of wheel granularity).
    let mut buf = [0u8; 1];
    let n = client.read(&mut buf).unwrap();
    assert_eq!(n, 0, "expected server-side close");
    assert_eq!(server.closed.load(Ordering::SeqCst), 1);

    server.handle.quit();
    server.join.join().unwrap();
}

#[test]
fn activity_refreshes_the_idle_deadline() {
    let server = spawn_idle_server(2);
    let mut client = TcpStream::connect(server.addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(8)))
        .unwrap();

    // Keep the connection busy past the original 2s deadline.
    let start = Instant::now();
    while start.elapsed() < Duration::from_millis(3500) {
        client.write_all(b"ping\n").unwrap();
        let mut echo = [0u8; 5];
        client.read_exact(&mut echo).unwrap();
        assert_eq!(&echo, b"ping\n");
        thread::sleep(Duration::from_millis(500));
    }
    assert_eq!(server.closed.load(Ordering::SeqCst), 0);

    // Now go quiet and get collected.
    let mut buf = [0u8; 1];
    let n = client.read(&mut buf).unwrap();
    assert_eq!(n, 0, "expected idle collection after going quiet");
    assert_eq!(server.closed.load(Ordering::SeqCst), 1);

    server.handle.quit();
    server.join.join().unwrap();
}
