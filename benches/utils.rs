use rand::{Rng, SeedableRng, rngs::StdRng};
use serde_json::{Value, json};

/// Builds `n` profile contexts for `template_curly.tl`. The seed is fixed so
/// every run renders the same data.
pub fn generate_random_contexts(n: usize) -> Vec<Value> {
    let mut rng = StdRng::seed_from_u64(42);
    (0..n).map(|_| profile(&mut rng)).collect()
}

fn profile(rng: &mut StdRng) -> Value {
    let items: Vec<Value> = (0..rng.random_range(3..10))
        .map(|_| {
            json!({
                "name": word(rng, 3, 8),
                "value": rng.random_range(10..1000),
                "special": rng.random_bool(0.3),
            })
        })
        .collect();

    json!({
        "user": {
            // Some names need escaping.
            "name": format!("{} <{}>", word(rng, 5, 10), word(rng, 3, 6)),
            "age": rng.random_range(18..80),
            "active": rng.random_bool(0.7),
        },
        "items": items,
        "show_details": rng.random_bool(0.8),
        "has_access": rng.random_bool(0.6),
    })
}

fn word(rng: &mut StdRng, min_len: usize, max_len: usize) -> String {
    let len = rng.random_range(min_len..=max_len);
    (0..len)
        .map(|_| char::from(b'a'.saturating_add(rng.random_range(0..26))))
        .collect()
}

/// Prints the size of the running benchmark binary.
pub fn print_binary_size() {
    let binary_path = std::env::current_exe().unwrap();
    let size_bytes = std::fs::metadata(&binary_path).unwrap().len();
    #[allow(clippy::cast_precision_loss, reason = "display only")]
    let size_kb = size_bytes as f64 / 1024.0;

    println!(
        "Binary size: {:.2} MB ({size_kb:.2} KB, {size_bytes} bytes)",
        size_kb / 1024.0
    );
    println!("Binary path: {}", binary_path.display());
}
