//! Multi-threaded guinea pig: eight threads spinning in distinct functions,
//! so each should show up around one eighth of the profile.

use std::thread;

macro_rules! spinner {
    ($name:ident) => {
        #[inline(never)]
        fn $name() -> u64 {
            let mut seed = 1u64;
            loop {
                seed = seed.rotate_left(5) ^ 0x2545f4914f6cdd1d;
                if seed == 0 {
                    return seed;
                }
            }
        }
    };
}

spinner!(spin_0);
spinner!(spin_1);
spinner!(spin_2);
spinner!(spin_3);
spinner!(spin_4);
spinner!(spin_5);
spinner!(spin_6);
spinner!(spin_7);

fn main() {
    let spinners: Vec<fn() -> u64> = vec![
        spin_0, spin_1, spin_2, spin_3, spin_4, spin_5, spin_6, spin_7,
    ];
    let handles: Vec<_> = spinners
        .into_iter()
        .map(|spin| thread::spawn(move || spin()))
        .collect();
    for handle in handles {
        let _ = handle.join();
    }
}
