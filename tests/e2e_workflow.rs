//! End-to-end workflow test
//!
//! Tests the complete library workflow:
//! 1. Load a catalogue from disk
//! 2. Fetch an extension (directory and CRX)
//! 3. Verify and patch
//! 4. Emit a loadable tree, or nothing on failure

use extension_patcher::{
    integrity, load_from_path, ArchiveSource, Catalogue, DirectorySink, DirectorySource,
    FailureKind, FailurePolicy, FileProcessor, Metadata, PackageSource, PatchSession, Position,
    ProcessError, SessionError, Step, TransformError,
};
use std::fs;
use std::io::{Cursor, Write};
use std::path::Path;
use tempfile::TempDir;

const INDEX_JS: &str = r#"const UNIVERSE = window.location.host.split(".")[0];
let dataHelper = new DataHelper(UNIVERSE);
class OGInfinity {
  start() {
    this.json.universe = UNIVERSE;
    return new DataHelper(UNIVERSE);
  }
}
"#;

const DATA_HELPER_JS: &str = r#"class DataHelper {
  constructor(universe) {
    this.universe = universe;
  }
  update() {
    return getPlayers(this.universe);
  }
}
"#;

const MANIFEST_JSON: &str = r#"{
  "name": "OGame Infinity",
  "version": "2.4.1",
  "host_permissions": ["https://*.ogame.gameforge.com/*"]
}"#;

/// Create an unpacked mock extension
fn setup_extension(root: &Path) {
    fs::create_dir_all(root.join("ctxcontent")).unwrap();
    fs::write(root.join("manifest.json"), MANIFEST_JSON).unwrap();
    fs::write(root.join("ctxcontent/index.js"), INDEX_JS).unwrap();
    fs::write(root.join("ctxcontent/data-helper.js"), DATA_HELPER_JS).unwrap();
}

/// Pack the same extension as a CRX3 file
fn write_crx(path: &Path) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options =
        zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    for (name, content) in [
        ("manifest.json", MANIFEST_JSON),
        ("ctxcontent/index.js", INDEX_JS),
        ("ctxcontent/data-helper.js", DATA_HELPER_JS),
    ] {
        writer.start_file(name, options).unwrap();
        writer.write_all(content.as_bytes()).unwrap();
    }
    let zip = writer.finish().unwrap().into_inner();

    let header = b"signed-header-proto";
    let mut crx = Vec::new();
    crx.extend_from_slice(b"Cr24");
    crx.extend_from_slice(&3u32.to_le_bytes());
    crx.extend_from_slice(&(header.len() as u32).to_le_bytes());
    crx.extend_from_slice(header);
    crx.extend_from_slice(&zip);
    fs::write(path, &crx).unwrap();
    crx
}

fn catalogue_toml(sha256: &str) -> String {
    format!(
        r#"[meta]
name = "infinity-ninja"
extension = "ogame-infinity"
version = "2.4.1"
sha256 = "{sha256}"

[[files]]
path = "/ctxcontent/index.js"

[[files.steps]]
type = "replace"
old = "new DataHelper(UNIVERSE)"
new = "new DataHelper(HOST, UNIVERSE)"
count = 2

[[files.steps]]
type = "prepend"
text = """
const HOST = window.location.host;
"""

[[files]]
path = "/ctxcontent/data-helper.js"

[[files.steps]]
type = "replace"
old = "constructor(universe) {{"
new = "constructor(host, universe) {{"

[[files.steps]]
type = "insert"
anchor = "this.universe = universe;"
text = "this.host = host;"
position = "after"

[[files.steps]]
type = "replace"
old = "getPlayers(this.universe)"
new = "getPlayers(this.host)"

[[files]]
path = "/manifest.json"

[[files.steps]]
type = "json"

[[files.steps.edits]]
op = "set"
pointer = "/name"
value = "OGame Infinity Ninja"

[[files.steps.edits]]
op = "push"
pointer = "/host_permissions"
value = "https://*.ogame.org/*"
"#
    )
}

fn directory_digest(root: &Path) -> String {
    let fetched = DirectorySource::new(root).fetch().unwrap();
    integrity::digest(&fetched.raw)
}

#[test]
fn test_directory_extension_end_to_end() {
    let dir = TempDir::new().unwrap();
    let ext = dir.path().join("ext");
    setup_extension(&ext);

    let catalogue_path = dir.path().join("infinity.toml");
    fs::write(&catalogue_path, catalogue_toml(&directory_digest(&ext))).unwrap();
    let catalogue = load_from_path(&catalogue_path).unwrap();

    let out = dir.path().join("out");
    let (outcome, written) = PatchSession::new(&catalogue)
        .run_into(&DirectorySource::new(&ext), &DirectorySink::new(&out))
        .unwrap();

    assert_eq!(outcome.files.len(), 3);
    assert_eq!(outcome.version.as_deref(), Some("2.4.1"));

    let index = fs::read_to_string(written.join("ctxcontent/index.js")).unwrap();
    assert!(index.starts_with("const HOST = window.location.host;\n"));
    assert_eq!(index.matches("new DataHelper(HOST, UNIVERSE)").count(), 2);
    assert!(!index.contains("new DataHelper(UNIVERSE)"));

    let helper = fs::read_to_string(written.join("ctxcontent/data-helper.js")).unwrap();
    assert!(helper.contains("constructor(host, universe) {"));
    assert!(helper.contains("this.universe = universe;this.host = host;"));
    assert!(helper.contains("getPlayers(this.host)"));

    let manifest: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(written.join("manifest.json")).unwrap()).unwrap();
    assert_eq!(manifest["name"], "OGame Infinity Ninja");
    assert_eq!(manifest["host_permissions"].as_array().unwrap().len(), 2);

    // The upstream tree is never touched.
    assert_eq!(
        fs::read_to_string(ext.join("ctxcontent/index.js")).unwrap(),
        INDEX_JS
    );
}

#[test]
fn test_crx_extension_end_to_end() {
    let dir = TempDir::new().unwrap();
    let crx_path = dir.path().join("infinity-2.4.1.crx");
    let crx = write_crx(&crx_path);

    let catalogue_path = dir.path().join("infinity.toml");
    fs::write(&catalogue_path, catalogue_toml(&integrity::digest(&crx))).unwrap();
    let catalogue = load_from_path(&catalogue_path).unwrap();

    let out = dir.path().join("out");
    let (outcome, written) = PatchSession::new(&catalogue)
        .run_into(&ArchiveSource::new(&crx_path), &DirectorySink::new(&out))
        .unwrap();

    assert_eq!(outcome.digest.to_hex(), integrity::digest(&crx));
    let helper = fs::read_to_string(written.join("ctxcontent/data-helper.js")).unwrap();
    assert!(helper.contains("getPlayers(this.host)"));
}

#[test]
fn test_integrity_mismatch_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let ext = dir.path().join("ext");
    setup_extension(&ext);

    let pinned = directory_digest(&ext);
    // Upstream ships a new build with one byte changed.
    fs::write(
        ext.join("ctxcontent/index.js"),
        INDEX_JS.replace("split(\".\")", "split(\",\")"),
    )
    .unwrap();

    let catalogue_path = dir.path().join("infinity.toml");
    fs::write(&catalogue_path, catalogue_toml(&pinned)).unwrap();
    let catalogue = load_from_path(&catalogue_path).unwrap();

    let out = dir.path().join("out");
    let err = PatchSession::new(&catalogue)
        .run_into(&DirectorySource::new(&ext), &DirectorySink::new(&out))
        .unwrap_err();

    assert_eq!(err.kind(), FailureKind::IntegrityMismatch);
    assert!(err.process_errors().is_empty());
    assert!(!out.exists());
}

#[test]
fn test_layout_drift_is_file_not_found() {
    let dir = TempDir::new().unwrap();
    let ext = dir.path().join("ext");
    setup_extension(&ext);
    let sha = directory_digest(&ext);

    let catalogue = Catalogue::new(Metadata::new("drift", sha))
        .file(FileProcessor::new("/missing.js").step(Step::replace("a", "b", 1)));

    let out = dir.path().join("out");
    let err = PatchSession::new(&catalogue)
        .run_into(&DirectorySource::new(&ext), &DirectorySink::new(&out))
        .unwrap_err();

    assert_eq!(err.kind(), FailureKind::FileNotFound);
    assert!(err.to_string().contains("/missing.js"));
    assert!(!out.exists());
}

#[test]
fn test_custom_step_failure_is_transform() {
    let dir = TempDir::new().unwrap();
    let ext = dir.path().join("ext");
    setup_extension(&ext);
    let sha = directory_digest(&ext);

    let catalogue = Catalogue::new(Metadata::new("custom", sha)).file(
        FileProcessor::new("/ctxcontent/index.js")
            .step(Step::replace("const UNIVERSE", "var UNIVERSE", 1))
            .step(Step::custom("require-minified", |input: &[u8]| {
                if input.contains(&b'\n') {
                    Err(TransformError::Custom {
                        step: "require-minified".to_string(),
                        message: "expected a single-line bundle".to_string(),
                    })
                } else {
                    Ok(input.to_vec())
                }
            })),
    );

    let err = PatchSession::new(&catalogue)
        .run(&DirectorySource::new(&ext))
        .unwrap_err();

    assert_eq!(err.kind(), FailureKind::Transform);
    match err {
        SessionError::Process(ProcessError::Step { step, .. }) => assert_eq!(step, 2),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn test_collect_all_reports_every_drifted_file() {
    let dir = TempDir::new().unwrap();
    let ext = dir.path().join("ext");
    setup_extension(&ext);
    let sha = directory_digest(&ext);

    let catalogue = Catalogue::new(Metadata::new("collect", sha))
        .file(
            FileProcessor::new("/ctxcontent/index.js")
                .step(Step::replace("new DataHelper(UNIVERSE)", "x", 3)),
        )
        .file(
            FileProcessor::new("/ctxcontent/data-helper.js")
                .step(Step::insert("this.planets = [];", "x", Position::Before)),
        )
        .file(FileProcessor::new("/manifest.json").step(Step::append("\n")));

    let out = dir.path().join("out");
    let err = PatchSession::new(&catalogue)
        .policy(FailurePolicy::CollectAll)
        .run_into(&DirectorySource::new(&ext), &DirectorySink::new(&out))
        .unwrap_err();

    let kinds: Vec<_> = err.process_errors().iter().map(|e| e.kind()).collect();
    assert_eq!(
        kinds,
        vec![
            FailureKind::ReplacementCountMismatch,
            FailureKind::AnchorNotFound
        ]
    );
    assert!(!out.exists());
}

#[test]
fn test_output_directory_must_be_empty() {
    let dir = TempDir::new().unwrap();
    let ext = dir.path().join("ext");
    setup_extension(&ext);
    let catalogue = load_catalogue_for(&ext, dir.path());

    let out = dir.path().join("out");
    fs::create_dir_all(&out).unwrap();
    fs::write(out.join("leftover.js"), "old").unwrap();

    let err = PatchSession::new(&catalogue)
        .run_into(&DirectorySource::new(&ext), &DirectorySink::new(&out))
        .unwrap_err();
    assert_eq!(err.kind(), FailureKind::Source);

    PatchSession::new(&catalogue)
        .run_into(
            &DirectorySource::new(&ext),
            &DirectorySink::new(&out).overwrite(true),
        )
        .unwrap();
    assert!(out.join("ctxcontent/index.js").exists());
}

fn load_catalogue_for(ext: &Path, dir: &Path) -> Catalogue {
    let catalogue_path = dir.join("infinity.toml");
    fs::write(&catalogue_path, catalogue_toml(&directory_digest(ext))).unwrap();
    load_from_path(&catalogue_path).unwrap()
}

#[test]
fn test_bundled_catalogue_loads() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("catalogues/infinity.toml");
    let catalogue = load_from_path(&path).unwrap();

    assert_eq!(catalogue.meta.name, "infinity-ninja");
    assert_eq!(catalogue.meta.version.as_deref(), Some("2.4.1"));
    assert_eq!(catalogue.files.len(), 13);
    assert_eq!(catalogue.files[0].path, "/manifest.json");
    // background.js is shipped as-is but still has to exist upstream.
    assert!(catalogue.files[12].steps.is_empty());
}
