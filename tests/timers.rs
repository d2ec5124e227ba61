use eddy::EventLoopThread;
use eddy::TimerId;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn timers_fire_in_expiration_order() {
    init_logging();
    let mut loop_thread = EventLoopThread::new(None, "timer-order");
    let handle = loop_thread.start_loop();

    let order = Arc::new(Mutex::new(Vec::new()));
    for delay_ms in [30u64, 10, 20] {
        let order = order.clone();
        handle.run_after(Duration::from_millis(delay_ms), move || {
            order.lock().unwrap().push(delay_ms);
        });
    }

    thread::sleep(Duration::from_millis(200));
    assert_eq!(*order.lock().unwrap(), vec![10, 20, 30]);
}

#[test]
fn cancelled_timer_never_fires() {
    init_logging();
    let mut loop_thread = EventLoopThread::new(None, "timer-cancel");
    let handle = loop_thread.start_loop();

    let fired = Arc::new(AtomicBool::new(false));
    let id = {
        let fired = fired.clone();
        handle.run_after(Duration::from_millis(50), move || {
            fired.store(true, Ordering::SeqCst);
        })
    };
    handle.cancel(id);

    thread::sleep(Duration::from_millis(200));
    assert!(!fired.load(Ordering::SeqCst));
}

#[test]
fn cancelling_a_stale_id_is_harmless() {
    init_logging();
    let mut loop_thread = EventLoopThread::new(None, "timer-stale");
    let handle = loop_thread.start_loop();

    let fired = Arc::new(AtomicBool::new(false));
    let id = {
        let fired = fired.clone();
        handle.run_after(Duration::from_millis(10), move || {
            fired.store(true, Ordering::SeqCst);
        })
    };

    thread::sleep(Duration::from_millis(100));
    assert!(fired.load(Ordering::SeqCst));
    // Already fired: cancelling must be a no-op, not a crash.
    handle.cancel(id);
    handle.cancel(id);
}

#[test]
fn repeating_timer_stops_after_cancel() {
    init_logging();
    let mut loop_thread = EventLoopThread::new(None, "timer-repeat");
    let handle = loop_thread.start_loop();

    let count = Arc::new(AtomicUsize::new(0));
    let id = {
        let count = count.clone();
        handle.run_every(Duration::from_millis(25), move || {
            count.fetch_add(1, Ordering::SeqCst);
        })
    };

    thread::sleep(Duration::from_millis(140));
    assert!(count.load(Ordering::SeqCst) >= 3);

    handle.cancel(id);
    thread::sleep(Duration::from_millis(100));
    let after_cancel = count.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(150));
    assert_eq!(count.load(Ordering::SeqCst), after_cancel);
}

#[test]
fn repeating_timer_can_cancel_itself_mid_fire() {
    init_logging();
    let mut loop_thread = EventLoopThread::new(None, "timer-self-cancel");
    let handle = loop_thread.start_loop();

    let count = Arc::new(AtomicUsize::new(0));
    let id_slot: Arc<Mutex<Option<TimerId>>> = Arc::new(Mutex::new(None));

    let id = {
        let count = count.clone();
        let id_slot = id_slot.clone();
        let handle = handle.clone();
        handle.clone().run_every(Duration::from_millis(20), move || {
            let fired = count.fetch_add(1, Ordering::SeqCst) + 1;
            if fired >= 2 {
                if let Some(id) = id_slot.lock().unwrap().take() {
                    // Cancelled while its own callback runs: the timer must
                    // not be re-armed.
                    handle.cancel(id);
                }
            }
        })
    };
    *id_slot.lock().unwrap() = Some(id);

    thread::sleep(Duration::from_millis(300));
    assert_eq!(count.load(Ordering::SeqCst), 2);
}
