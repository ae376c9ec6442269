use kernel_sync::SyncOnceCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

#[test]
fn empty_until_initialized() {
    let cell: SyncOnceCell<u32> = SyncOnceCell::new();
    assert!(cell.get().is_none());

    assert_eq!(*cell.get_or_init(|| 7), 7);
    assert_eq!(cell.get(), Some(&7));
}

#[test]
fn later_initializers_are_ignored() {
    let cell = SyncOnceCell::new();
    cell.get_or_init(|| 1u32);
    // The closure must not even run once a value is published.
    let v = cell.get_or_init(|| panic!("second init"));
    assert_eq!(*v, 1);
}

#[test]
fn racing_initializers_agree_on_one_value() {
    let threads = 8;
    let runs = cell_race(threads);
    assert_eq!(runs, 1, "init closure ran more than once");
}

/// Race `threads` initializers against each other; returns how many times
/// the init closure actually ran.
fn cell_race(threads: usize) -> usize {
    let cell: Arc<SyncOnceCell<usize>> = Arc::new(SyncOnceCell::new());
    let runs = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for i in 0..threads {
        let cell = Arc::clone(&cell);
        let runs = Arc::clone(&runs);
        handles.push(thread::spawn(move || {
            *cell.get_or_init(|| {
                runs.fetch_add(1, Ordering::SeqCst);
                i
            })
        }));
    }

    let first = handles
        .into_iter()
        .map(|h| h.join().expect("join"))
        .collect::<Vec<_>>();
    // Every thread observed the same winner.
    assert!(first.windows(2).all(|w| w[0] == w[1]));
    runs.load(Ordering::SeqCst)
}
