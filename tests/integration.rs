use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn sdx_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("sdx");
    path
}

fn setup_corpus(books: &[(&str, &str)]) -> (TempDir, PathBuf, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let collection = root.join("books");
    fs::create_dir_all(&collection).unwrap();
    for (name, body) in books {
        fs::write(collection.join(name), body).unwrap();
    }

    let config_content = format!(
        r#"[server]
bind = "127.0.0.1:7411"

[chunking]
chunk_size = 200
chunk_overlap = 40

[retrieval]
top_k = 4
top_k_per_shard = 3
max_workers = 4

[embedding]
provider = "hashed"
dims = 64

[store]
root = "{}"
"#,
        collection.display()
    );

    let config_path = root.join("sdx.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path, collection)
}

fn run_sdx(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = sdx_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run sdx binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

fn fingerprint_dirs(collection: &Path) -> Vec<String> {
    let mut dirs: Vec<String> = fs::read_dir(collection)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|name| name.len() == 32 && name.chars().all(|c| c.is_ascii_hexdigit()))
        .collect();
    dirs.sort();
    dirs
}

#[test]
fn build_creates_fingerprint_directories() {
    let (_tmp, config_path, collection) = setup_corpus(&[
        ("alpha.txt", "Alpha book discusses Rust ownership and borrowing in detail."),
        ("beta.txt", "Beta book covers database storage engines and write-ahead logs."),
    ]);

    let (stdout, stderr, success) = run_sdx(&config_path, &["build", collection.to_str().unwrap()]);
    assert!(success, "build failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("2 built"));

    let dirs = fingerprint_dirs(&collection);
    assert_eq!(dirs.len(), 2);
    for dir in &dirs {
        let index_dir = collection.join(dir);
        assert!(index_dir.join("index.vec").is_file());
        assert!(index_dir.join("chunks.json").is_file());
        assert!(index_dir.join("manifest.json").is_file());

        let manifest: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(index_dir.join("manifest.json")).unwrap())
                .unwrap();
        assert_eq!(manifest["schema_version"], 1);
        assert_eq!(manifest["fingerprints"][0], dir.as_str());
        assert_eq!(manifest["embedding_model"], "hashed-64");
        assert!(manifest["chunks"].as_u64().unwrap() > 0);
    }
}

#[test]
fn second_build_reuses_everything() {
    let (_tmp, config_path, collection) = setup_corpus(&[(
        "alpha.txt",
        "Idempotent build content that never changes between runs.",
    )]);

    let (stdout1, _, success1) = run_sdx(&config_path, &["build", collection.to_str().unwrap()]);
    assert!(success1, "first build failed: {}", stdout1);
    assert!(stdout1.contains("1 built"));

    let (stdout2, _, success2) = run_sdx(&config_path, &["build", collection.to_str().unwrap()]);
    assert!(success2, "second build failed: {}", stdout2);
    assert!(stdout2.contains("0 built"), "expected full reuse: {}", stdout2);
    assert!(stdout2.contains("1 cached"));
}

#[test]
fn rename_reuses_index_directory() {
    let (_tmp, config_path, collection) = setup_corpus(&[(
        "original.txt",
        "Content that survives a rename without re-embedding.",
    )]);

    run_sdx(&config_path, &["build", collection.to_str().unwrap()]);
    let before = fingerprint_dirs(&collection);
    assert_eq!(before.len(), 1);

    fs::rename(
        collection.join("original.txt"),
        collection.join("renamed.txt"),
    )
    .unwrap();

    let (stdout, _, success) = run_sdx(&config_path, &["build", collection.to_str().unwrap()]);
    assert!(success, "rebuild failed: {}", stdout);
    assert!(stdout.contains("0 built"), "rename must not rebuild: {}", stdout);

    let after = fingerprint_dirs(&collection);
    assert_eq!(after, before, "no new directory after rename");

    let manifest: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(collection.join(&after[0]).join("manifest.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(manifest["filename"], "renamed.txt");
}

#[test]
fn reclaim_removes_exactly_the_orphans() {
    let books: Vec<(String, String)> = (0..10)
        .map(|i| {
            (
                format!("book{}.txt", i),
                format!("Distinct content for book number {}.", i),
            )
        })
        .collect();
    let refs: Vec<(&str, &str)> = books.iter().map(|(n, b)| (n.as_str(), b.as_str())).collect();
    let (_tmp, config_path, collection) = setup_corpus(&refs);

    run_sdx(&config_path, &["build", collection.to_str().unwrap()]);
    assert_eq!(fingerprint_dirs(&collection).len(), 10);

    for i in 0..3 {
        fs::remove_file(collection.join(format!("book{}.txt", i))).unwrap();
    }

    // Dry run first: nothing deleted.
    let (stdout, _, success) = run_sdx(
        &config_path,
        &["reclaim", collection.to_str().unwrap(), "--dry-run"],
    );
    assert!(success);
    let report: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(report["orphans_found"], 3);
    assert_eq!(report["removed"].as_array().unwrap().len(), 0);
    assert_eq!(fingerprint_dirs(&collection).len(), 10);

    // Real run removes exactly the three orphans.
    let (stdout, _, success) = run_sdx(&config_path, &["reclaim", collection.to_str().unwrap()]);
    assert!(success);
    let report: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(report["orphans_found"], 3);
    assert_eq!(report["removed"].as_array().unwrap().len(), 3);
    assert_eq!(report["kept"], 7);
    assert!(report["bytes_freed"].as_u64().unwrap() > 0);
    assert_eq!(report["errors"].as_array().unwrap().len(), 0);
    assert_eq!(fingerprint_dirs(&collection).len(), 7);
}

#[test]
fn query_fans_out_over_all_shards() {
    let (_tmp, config_path, collection) = setup_corpus(&[
        ("rust.txt", "The borrow checker enforces ownership rules at compile time."),
        ("python.txt", "Generators yield values lazily one at a time."),
        ("go.txt", "Goroutines communicate by sharing channels."),
        ("db.txt", "Write-ahead logging makes storage engines durable."),
        ("ml.txt", "Gradient descent minimizes the loss function."),
    ]);

    run_sdx(&config_path, &["build", collection.to_str().unwrap()]);

    let (stdout, stderr, success) = run_sdx(&config_path, &["query", "ownership rules"]);
    assert!(success, "query failed: stdout={}, stderr={}", stdout, stderr);

    let output: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(output["stats"]["shards_total"], 5);
    assert_eq!(output["stats"]["shards_successful"], 5);

    let run = &output["queries"][0];
    assert_eq!(run["sources"]["successful"], 5);
    assert_eq!(run["sources"]["failed"].as_array().unwrap().len(), 0);

    let data = run["results"]["data"].as_array().unwrap();
    assert!(!data.is_empty());
    // At most shards × top_k_per_shard passages before dedup; scores
    // descend monotonically in the aggregated list.
    assert!(data.len() <= 15);
    let scores: Vec<f64> = data
        .iter()
        .map(|d| d["score"].as_f64().unwrap())
        .collect();
    for pair in scores.windows(2) {
        assert!(pair[0] >= pair[1], "scores must not increase: {:?}", scores);
    }
    // Results carry display filenames, not fingerprints.
    let first_source = data[0]["source"].as_str().unwrap();
    assert!(first_source.ends_with(".txt"), "source: {}", first_source);
}

#[test]
fn query_restricted_to_selected_hashes() {
    let (_tmp, config_path, collection) = setup_corpus(&[
        ("a.txt", "First searchable body."),
        ("b.txt", "Second searchable body."),
    ]);

    run_sdx(&config_path, &["build", collection.to_str().unwrap()]);
    let dirs = fingerprint_dirs(&collection);

    let (stdout, _, success) = run_sdx(
        &config_path,
        &["query", "searchable body", "--hash", &dirs[0]],
    );
    assert!(success);
    let output: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(output["stats"]["shards_total"], 1);
}

#[test]
fn query_with_unknown_hash_fails() {
    let (_tmp, config_path, collection) =
        setup_corpus(&[("a.txt", "Some content to index.")]);
    run_sdx(&config_path, &["build", collection.to_str().unwrap()]);

    let missing = "0".repeat(32);
    let (_, _, success) = run_sdx(&config_path, &["query", "anything", "--hash", &missing]);
    assert!(!success, "unknown fingerprint must fail");
}

#[test]
fn query_rejects_more_than_three_questions() {
    let (_tmp, config_path, collection) =
        setup_corpus(&[("a.txt", "Some content to index.")]);
    run_sdx(&config_path, &["build", collection.to_str().unwrap()]);

    let (_, stderr, success) =
        run_sdx(&config_path, &["query", "q1", "q2", "q3", "q4"]);
    assert!(!success);
    assert!(stderr.contains("at most 3"), "stderr: {}", stderr);
}

#[test]
fn merged_build_writes_collection_manifest() {
    let (_tmp, config_path, collection) = setup_corpus(&[
        ("a.txt", "Merged collection member one."),
        ("b.txt", "Merged collection member two."),
    ]);

    let (stdout, stderr, success) = run_sdx(
        &config_path,
        &["build", collection.to_str().unwrap(), "--merged"],
    );
    assert!(success, "merged build failed: stdout={}, stderr={}", stdout, stderr);

    let manifest: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(collection.join("manifest.json")).unwrap())
            .unwrap();
    assert_eq!(manifest["files"].as_object().unwrap().len(), 2);
    assert!(manifest["total_chunks"].as_u64().unwrap() > 0);

    let merged = collection.join(".shelfdex_index");
    assert!(merged.join("index.vec").is_file());
    assert!(merged.join("chunks.json").is_file());
    assert!(merged.join("manifest.json").is_file());

    // Renaming a member updates the collection manifest key but keeps the
    // merged index.
    fs::rename(collection.join("a.txt"), collection.join("z.txt")).unwrap();
    let (stdout, _, success) = run_sdx(
        &config_path,
        &["build", collection.to_str().unwrap(), "--merged"],
    );
    assert!(success);
    assert!(stdout.contains("up to date"), "rename must not rebuild: {}", stdout);

    let manifest: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(collection.join("manifest.json")).unwrap())
            .unwrap();
    assert!(manifest["files"].get("z.txt").is_some());
    assert!(manifest["files"].get("a.txt").is_none());
}

#[test]
fn manifest_command_maps_fingerprints_to_filenames() {
    let (_tmp, config_path, collection) = setup_corpus(&[
        ("one.txt", "Contents of book one."),
        ("two.txt", "Contents of book two."),
    ]);

    let (stdout, _, success) = run_sdx(&config_path, &["manifest", collection.to_str().unwrap()]);
    assert!(success);

    let manifest: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let map = manifest.as_object().unwrap();
    assert_eq!(map.len(), 2);
    for (hash, name) in map {
        assert_eq!(hash.len(), 32);
        assert!(name.as_str().unwrap().ends_with(".txt"));
    }
}

#[test]
fn build_cleanup_removes_orphans_in_one_pass() {
    let (_tmp, config_path, collection) = setup_corpus(&[
        ("keep.txt", "This book stays."),
        ("drop.txt", "This book goes away."),
    ]);

    run_sdx(&config_path, &["build", collection.to_str().unwrap()]);
    fs::remove_file(collection.join("drop.txt")).unwrap();

    let (stdout, _, success) = run_sdx(
        &config_path,
        &["build", collection.to_str().unwrap(), "--cleanup"],
    );
    assert!(success, "build --cleanup failed: {}", stdout);
    assert!(stdout.contains("1 orphans removed"), "stdout: {}", stdout);
    assert_eq!(fingerprint_dirs(&collection).len(), 1);
}
