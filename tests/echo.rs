use eddy::Buffer;
use eddy::EventLoop;
use eddy::TcpServer;
use std::io::Read;
use std::io::Write;
use std::net::TcpStream;
use std::sync::mpsc;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use std::time::Instant;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn single_loop_echo() {
    init_logging();
    let (addr_tx, addr_rx) = mpsc::channel();
    let (handle_tx, handle_rx) = mpsc::channel();
    let observations = Arc::new(Mutex::new(Vec::<&str>::new()));

    let server_thread = thread::spawn({
        let observations = observations.clone();
        move || {
            let event_loop = EventLoop::new();
            let server =
                TcpServer::new(&event_loop, "127.0.0.1:0".parse().unwrap(), "echo").unwrap();
            server.set_connection_callback(move |conn| {
                observations
                    .lock()
                    .unwrap()
                    .push(if conn.connected() { "up" } else { "down" });
            });
            server.set_message_callback(|conn, buffer: &mut Buffer, _when| {
                let bytes = buffer.retrieve_all_as_bytes();
                conn.send(&bytes);
            });
            server.start();

            addr_tx.send(server.listen_addr()).unwrap();
            handle_tx.send(event_loop.handle()).unwrap();
            event_loop.run();
        }
    });

    let addr = addr_rx.recv().unwrap();
    let handle = handle_rx.recv().unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"ABCD").unwrap();
    let mut reply = [0u8; 4];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"ABCD");
    drop(client);

    // The close lands asynchronously on the server loop.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if observations.lock().unwrap().len() == 2 {
            break;
        }
        assert!(Instant::now() < deadline, "close was never observed");
        thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(*observations.lock().unwrap(), vec!["up", "down"]);

    handle.quit();
    server_thread.join().unwrap();
}

#[test]
fn echoes_a_large_payload_through_the_output_buffer() {
    init_logging();
    let (addr_tx, addr_rx) = mpsc::channel();
    let (handle_tx, handle_rx) = mpsc::channel();

    let server_thread = thread::spawn(move || {
        let event_loop = EventLoop::new();
        let server =
            TcpServer::new(&event_loop, "127.0.0.1:0".parse().unwrap(), "echo-large").unwrap();
        server.set_message_callback(|conn, buffer: &mut Buffer, _when| {
            let bytes = buffer.retrieve_all_as_bytes();
            conn.send(&bytes);
        });
        server.start();

        addr_tx.send(server.listen_addr()).unwrap();
        handle_tx.send(event_loop.handle()).unwrap();
        event_loop.run();
    });

    let addr = addr_rx.recv().unwrap();
    let handle = handle_rx.recv().unwrap();

    // Large enough that the echo cannot fit in the socket buffers and must
    // drain through write-readiness, in order, without loss.
    let payload: Vec<u8> = (0..1_000_000u32).map(|i| (i % 251) as u8).collect();

    let mut client = TcpStream::connect(addr).unwrap();
    let mut writer = client.try_clone().unwrap();
    let sent = payload.clone();
    let feeder = thread::spawn(move || {
        writer.write_all(&sent).unwrap();
    });

    let mut received = vec![0u8; payload.len()];
    client.read_exact(&mut received).unwrap();
    feeder.join().unwrap();
    assert_eq!(received, payload);

    handle.quit();
    server_thread.join().unwrap();
}
