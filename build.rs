use std::fs;
use std::path::{Path, PathBuf};

fn main() {
    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR missing");
    let analysis_dir = Path::new(&manifest_dir).join("src").join("analysis");
    println!("cargo:rerun-if-changed={}", analysis_dir.display());
    for path in classifier_sources(&analysis_dir) {
        let contents = fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("Failed to read {}: {}", path.display(), e));
        enforce_pure_classifier(production_code(&contents), &path);
    }
}

/// Every `.rs` file under the classifier directory, in a stable order.
fn classifier_sources(root: &Path) -> Vec<PathBuf> {
    let mut sources = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        for path in entries.flatten().map(|entry| entry.path()) {
            if path.is_dir() {
                pending.push(path);
            } else if path.extension().is_some_and(|ext| ext == "rs") {
                sources.push(path);
            }
        }
    }
    sources.sort();
    sources
}

// Test modules sit at the end of each file and may use the runtime freely.
fn production_code(contents: &str) -> &str {
    match contents.find("#[cfg(test)]") {
        Some(end) => &contents[..end],
        None => contents,
    }
}

// The classifier must give the same verdict for the same frozen test keys.
fn enforce_pure_classifier(code: &str, path: &Path) {
    const FORBIDDEN: &[&str] = &[
        "tokio",
        "TcpStream",
        "UdpSocket",
        "SystemTime",
        "Instant",
        "thread_rng",
        "std::fs",
        "std::io",
        "println!(",
        "eprintln!(",
    ];

    if let Some(token) = FORBIDDEN.iter().find(|token| code.contains(**token)) {
        panic!(
            "Forbidden token `{}` in classifier module: {}",
            token,
            path.display()
        );
    }
}
