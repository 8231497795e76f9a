//! Busy-loop guinea pig: `hot` does almost all the work, `cold` a sliver.

#[inline(never)]
fn cold(seed: u64) -> u64 {
    seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407)
}

#[inline(never)]
fn hot(mut seed: u64) -> u64 {
    for _ in 0..1_000_000 {
        seed = seed.rotate_left(7) ^ 0x9e3779b97f4a7c15;
    }
    cold(seed)
}

fn main() {
    let mut seed = std::process::id() as u64;
    loop {
        seed = hot(seed);
        if seed == 0 {
            // keep the optimizer from collapsing the loop
            println!("{}", seed);
        }
    }
}
