//! Text extraction for office documents and upload limits, driven through
//! the `pkb` binary.

use std::fs;
use std::path::Path;
use std::process::Command;
use tempfile::TempDir;

fn pkb_binary() -> std::path::PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop();
    path.pop();
    path.push("pkb");
    path
}

fn docx_with_text(phrase: &str) -> Vec<u8> {
    use std::io::Write;
    let mut buf = Vec::new();
    {
        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
        zip.start_file(
            "word/document.xml",
            zip::write::SimpleFileOptions::default(),
        )
        .unwrap();
        let xml = format!(
            "<?xml version=\"1.0\"?><w:document xmlns:w=\"http://schemas.openxmlformats.org/wordprocessingml/2006/main\"><w:body><w:p><w:r><w:t>{}</w:t></w:r></w:p></w:body></w:document>",
            phrase
        );
        zip.write_all(xml.as_bytes()).unwrap();
        zip.finish().unwrap();
    }
    buf
}

fn setup_env(max_file_bytes: u64) -> (TempDir, std::path::PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();
    fs::create_dir_all(root.join("inbox")).unwrap();

    let config = format!(
        r#"[db]
path = "{root}/data/pkb.sqlite"

[storage]
root = "{root}/files"
max_file_bytes = {max}

[server]
bind = "127.0.0.1:7341"
"#,
        root = root.display(),
        max = max_file_bytes
    );
    let config_path = root.join("pkb.toml");
    fs::write(&config_path, config).unwrap();

    let (_, stderr, success) = run_pkb(&config_path, &["init"]);
    assert!(success, "init failed: {}", stderr);
    (tmp, config_path)
}

fn run_pkb(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let output = Command::new(pkb_binary())
        .arg("--config")
        .arg(config_path)
        .args(args)
        .output()
        .expect("failed to run pkb");
    (
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
        output.status.success(),
    )
}

#[test]
fn docx_text_is_searchable() {
    let (tmp, config_path) = setup_env(10 * 1024 * 1024);
    let path = tmp.path().join("inbox").join("review.docx");
    fs::write(&path, docx_with_text("office test phrase")).unwrap();

    let (stdout, stderr, success) = run_pkb(&config_path, &["add", path.to_str().unwrap()]);
    assert!(success, "add failed: {} {}", stdout, stderr);

    let (stdout, _, _) = run_pkb(&config_path, &["search", "office phrase"]);
    assert!(stdout.contains("review.docx"), "search output: {}", stdout);
    assert!(stdout.contains("wordprocessingml"));
}

#[test]
fn corrupt_document_is_stored_without_text() {
    let (tmp, config_path) = setup_env(10 * 1024 * 1024);
    let path = tmp.path().join("inbox").join("broken.docx");
    fs::write(&path, b"this is not a zip archive").unwrap();

    let (stdout, stderr, success) = run_pkb(&config_path, &["add", path.to_str().unwrap()]);
    assert!(success, "add failed: {} {}", stdout, stderr);
    assert!(stdout.starts_with("stored"));

    // Still findable by name.
    let (stdout, _, _) = run_pkb(&config_path, &["search", "broken"]);
    assert!(stdout.contains("broken.docx"));
}

#[test]
fn oversized_file_is_rejected() {
    let (tmp, config_path) = setup_env(16);
    let path = tmp.path().join("inbox").join("big.txt");
    fs::write(&path, "more than sixteen bytes of text").unwrap();

    let (_, stderr, success) = run_pkb(&config_path, &["add", path.to_str().unwrap()]);
    assert!(!success);
    assert!(stderr.contains("too large"), "stderr: {}", stderr);

    let (stdout, _, _) = run_pkb(&config_path, &["search"]);
    assert!(stdout.contains("No results."));
}

#[test]
fn import_counts_oversized_files_as_failed() {
    let (tmp, config_path) = setup_env(16);
    let inbox = tmp.path().join("inbox");
    fs::write(inbox.join("small.txt"), "tiny").unwrap();
    fs::write(inbox.join("big.txt"), "more than sixteen bytes of text").unwrap();

    let (stdout, stderr, success) = run_pkb(
        &config_path,
        &["import", inbox.to_str().unwrap(), "--quiet"],
    );
    assert!(success, "import failed: {} {}", stdout, stderr);
    assert!(stdout.contains("stored: 1"));
    assert!(stdout.contains("failed: 1"));
}
