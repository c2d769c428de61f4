use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::thread;
use tempfile::TempDir;

fn write_config(dir: &TempDir, content: &str) -> PathBuf {
    let path = dir.path().join("harvest.toml");
    fs::write(&path, content).expect("Failed to write test config");
    path
}

fn local_store(dir: &Path) -> String {
    format!(
        r#"
[[triple_store]]
name = "vivo"
mode = "local"
location = "{}"
create_if_missing = true
graphs = ["http://vitro.mannlib.cornell.edu/default/vitro-kb-2"]
pool_size = 2
"#,
        dir.join("tdb").display()
    )
}

fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn harvest() -> Command {
    Command::cargo_bin("harvest").unwrap()
}

#[test]
fn test_validate_reports_backends() {
    let dir = TempDir::new().unwrap();
    let config = write_config(
        &dir,
        r#"
[[directory]]
name = "people"
url = "ldap://ldap.example.edu"
base_dn = "ou=people,dc=example,dc=edu"

[[relational]]
name = "grants"
engine = "postgres"
host = "db.example.edu"
user = "harvest"
database = "grants"
pool_size = 8
"#,
    );

    harvest()
        .args(["validate", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration OK: 2 backend(s)"))
        .stdout(predicate::str::contains("grants"))
        .stdout(predicate::str::contains("pool_size=8"));
}

#[test]
fn test_validate_rejects_duplicate_names() {
    let dir = TempDir::new().unwrap();
    let content = format!("{}{}", local_store(dir.path()), local_store(dir.path()));
    let config = write_config(&dir, &content);

    harvest()
        .args(["validate", "--config"])
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("duplicate backend name 'vivo'"));
}

#[test]
fn test_validate_missing_file() {
    harvest()
        .args(["validate", "--config", "/nonexistent/harvest.toml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load configuration"));
}

#[test]
fn test_check_local_triple_store() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, &local_store(dir.path()));

    harvest()
        .args(["check", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("OK     triple_store vivo"))
        .stdout(predicate::str::contains("resident=2"))
        .stdout(predicate::str::contains("All 1 backend(s) reachable"));

    assert!(dir.path().join("tdb").join("CURRENT").is_file());
}

#[test]
fn test_check_forwards_library_logs() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, &local_store(dir.path()));

    harvest()
        .args(["--log-level", "debug", "check", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stderr(predicate::str::contains("Warming pool 'vivo'"));
}

#[test]
fn test_check_unreachable_backend_fails() {
    let dir = TempDir::new().unwrap();
    let content = format!(
        r#"
[pool]
retry_attempts = 2
retry_backoff_ms = 1
connect_timeout_ms = 500

[[directory]]
name = "people"
url = "ldap://127.0.0.1:{}"
base_dn = "ou=people,dc=example,dc=edu"
pool_size = 1
{}"#,
        closed_port(),
        local_store(dir.path())
    );
    let config = write_config(&dir, &content);

    harvest()
        .args(["check", "--config"])
        .arg(&config)
        .assert()
        .failure()
        .stdout(predicate::str::contains("FAILED directory people"))
        .stdout(predicate::str::contains("OK     triple_store vivo"))
        .stderr(predicate::str::contains("1 of 2 backend(s) failed"));
}

#[test]
fn test_check_single_backend() {
    let dir = TempDir::new().unwrap();
    let content = format!(
        r#"
[[directory]]
name = "people"
url = "ldap://127.0.0.1:{}"
base_dn = "ou=people,dc=example,dc=edu"
{}"#,
        closed_port(),
        local_store(dir.path())
    );
    let config = write_config(&dir, &content);

    harvest()
        .args(["check", "--backend", "vivo", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("All 1 backend(s) reachable"))
        .stdout(predicate::str::contains("people").not());

    harvest()
        .args(["check", "--backend", "nope", "--config"])
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("No backend named 'nope'"));
}

fn pg_message(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut message = vec![tag];
    message.extend_from_slice(&(body.len() as u32 + 4).to_be_bytes());
    message.extend_from_slice(body);
    message
}

fn pg_read(stream: &mut TcpStream, tagged: bool) -> Option<(u8, Vec<u8>)> {
    let mut tag = [0u8; 1];
    if tagged {
        stream.read_exact(&mut tag).ok()?;
    }
    let mut len = [0u8; 4];
    stream.read_exact(&mut len).ok()?;
    let mut body = vec![0u8; u32::from_be_bytes(len) as usize - 4];
    stream.read_exact(&mut body).ok()?;
    Some((tag[0], body))
}

/// Accept one PostgreSQL login with trust auth, then answer until terminated
fn fake_postgres() -> (u16, thread::JoinHandle<(Vec<u8>, Vec<u8>)>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let startup = loop {
            let (_, body) = pg_read(&mut stream, false).unwrap();
            // SSLRequest or GSSENCRequest
            if body[..4] == 80_877_103u32.to_be_bytes() || body[..4] == 80_877_104u32.to_be_bytes() {
                stream.write_all(b"N").unwrap();
                continue;
            }
            break body;
        };

        let mut login = pg_message(b'R', &0u32.to_be_bytes());
        login.extend(pg_message(b'S', b"server_version\x0016.2\0"));
        login.extend(pg_message(b'K', &[0, 0, 0, 7, 0, 0, 0, 9]));
        login.extend(pg_message(b'Z', b"I"));
        stream.write_all(&login).unwrap();

        let mut seen = Vec::new();
        while let Some((tag, _)) = pg_read(&mut stream, true) {
            seen.push(tag);
            let reply = match tag {
                b'Q' => [pg_message(b'C', b"SELECT 0\0"), pg_message(b'Z', b"I")].concat(),
                b'S' => pg_message(b'Z', b"I"),
                b'X' => break,
                _ => continue,
            };
            stream.write_all(&reply).unwrap();
        }
        (startup, seen)
    });
    (port, server)
}

#[test]
fn test_check_postgres_login() {
    let (port, server) = fake_postgres();

    let dir = TempDir::new().unwrap();
    let config = write_config(
        &dir,
        &format!(
            r#"
[[relational]]
name = "grants"
engine = "postgres"
host = "127.0.0.1"
port = {}
user = "harvest"
password = "secret"
database = "grants"
pool_size = 1
"#,
            port
        ),
    );

    harvest()
        .args(["check", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("OK     relational grants"))
        .stdout(predicate::str::contains("created=1"));

    let (startup, _) = server.join().unwrap();
    let startup = String::from_utf8_lossy(&startup);
    assert!(startup.contains("user\0harvest\0"), "{:?}", startup);
    assert!(startup.contains("database\0grants\0"), "{:?}", startup);
}

#[test]
fn test_check_rejected_login_fails() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        loop {
            let (_, body) = pg_read(&mut stream, false).unwrap();
            if body[..4] == 80_877_103u32.to_be_bytes() || body[..4] == 80_877_104u32.to_be_bytes() {
                stream.write_all(b"N").unwrap();
                continue;
            }
            break;
        }
        let mut body = Vec::new();
        for (field, value) in [(b'S', "FATAL"), (b'C', "28P01"), (b'M', "password authentication failed")] {
            body.push(field);
            body.extend_from_slice(value.as_bytes());
            body.push(0);
        }
        body.push(0);
        stream.write_all(&pg_message(b'E', &body)).unwrap();
    });

    let dir = TempDir::new().unwrap();
    let config = write_config(
        &dir,
        &format!(
            r#"
[pool]
retry_attempts = 1

[[relational]]
name = "grants"
engine = "postgres"
host = "127.0.0.1"
port = {}
user = "harvest"
password = "wrong"
database = "grants"
pool_size = 1
"#,
            port
        ),
    );

    harvest()
        .args(["check", "--config"])
        .arg(&config)
        .assert()
        .failure()
        .stdout(predicate::str::contains("FAILED relational grants"));

    server.join().unwrap();
}
