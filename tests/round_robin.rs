use eddy::Buffer;
use eddy::EventLoop;
use eddy::TcpServer;
use std::collections::HashMap;
use std::io::Read;
use std::io::Write;
use std::net::TcpStream;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::thread::ThreadId;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn connections_are_dispatched_round_robin() {
    init_logging();
    let (addr_tx, addr_rx) = mpsc::channel();
    let (handle_tx, handle_rx) = mpsc::channel();

    // Worker loops are started one after the other, so tagging them with a
    // counter from the init callback numbers them in pool order.
    let tags: Arc<Mutex<HashMap<ThreadId, u8>>> = Arc::new(Mutex::new(HashMap::new()));
    let next_tag = Arc::new(AtomicU8::new(0));

    let server_thread = thread::spawn({
        let tags = tags.clone();
        move || {
            let event_loop = EventLoop::new();
            let server =
                TcpServer::new(&event_loop, "127.0.0.1:0".parse().unwrap(), "rr").unwrap();
            server.set_thread_num(3);
            server.set_thread_init_callback({
                let tags = tags.clone();
                let next_tag = next_tag.clone();
                move |_event_loop| {
                    let tag = next_tag.fetch_add(1, Ordering::SeqCst);
                    tags.lock().unwrap().insert(thread::current().id(), tag);
                }
            });
            server.set_message_callback({
                let tags = tags.clone();
                move |conn, buffer: &mut Buffer, _when| {
                    buffer.retrieve_all();
                    let tag = tags.lock().unwrap()[&thread::current().id()];
                    conn.send(&[tag]);
                }
            });
            server.start();

            addr_tx.send(server.listen_addr()).unwrap();
            handle_tx.send(event_loop.handle()).unwrap();
            event_loop.run();
        }
    });

    let addr = addr_rx.recv().unwrap();
    let handle = handle_rx.recv().unwrap();

    // Sequential connects: connection i must land on worker i mod 3.
    for i in 0..6u8 {
        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(b"which worker?").unwrap();
        let mut tag = [0u8; 1];
        client.read_exact(&mut tag).unwrap();
        assert_eq!(tag[0], i % 3, "connection {i} served by the wrong worker");
    }

    handle.quit();
    server_thread.join().unwrap();
}
