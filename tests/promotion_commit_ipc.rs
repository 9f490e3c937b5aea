use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_sisd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn sisd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error")
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

struct Sidecar {
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    next_id: u64,
}

impl Sidecar {
    fn call(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        self.next_id += 1;
        request_ok(
            &mut self.stdin,
            &mut self.reader,
            &self.next_id.to_string(),
            method,
            params,
        )
    }

    fn call_raw(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        self.next_id += 1;
        request(
            &mut self.stdin,
            &mut self.reader,
            &self.next_id.to_string(),
            method,
            params,
        )
    }
}

fn str_field(v: &serde_json::Value, key: &str) -> String {
    v.get(key)
        .and_then(|x| x.as_str())
        .unwrap_or_else(|| panic!("missing {} in {}", key, v))
        .to_string()
}

fn error_code(value: &serde_json::Value) -> &str {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

fn create_level(sc: &mut Sidecar, name: &str, sort: i64) -> String {
    let r = sc.call(
        "classLevels.create",
        json!({ "name": name, "sortOrder": sort }),
    );
    str_field(&r, "classLevelId")
}

fn enroll(sc: &mut Sidecar, last: &str, first: &str, level_id: &str) -> String {
    let r = sc.call(
        "students.enroll",
        json!({ "lastName": last, "firstName": first, "classLevelId": level_id }),
    );
    str_field(&r, "studentId")
}

fn listed_students(sc: &mut Sidecar, params: serde_json::Value) -> Vec<serde_json::Value> {
    sc.call("students.list", params)
        .get("students")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default()
}

#[test]
fn graduation_stamps_date_and_deactivates() {
    let workspace = temp_dir("sisd-commit-graduate");
    let (mut child, stdin, reader) = spawn_sidecar();
    let mut sc = Sidecar {
        stdin,
        reader,
        next_id: 0,
    };
    sc.call(
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let ss3 = create_level(&mut sc, "SS3", 6);
    let a = enroll(&mut sc, "Ojo", "Bisi", &ss3);
    let b = enroll(&mut sc, "Umar", "Zainab", &ss3);

    let commit = sc.call(
        "promotion.commit",
        json!({ "fromClass": "SS3", "toClass": "GRADUATED", "studentIds": [a, b] }),
    );
    assert_eq!(commit.get("graduatedCount").and_then(|v| v.as_i64()), Some(2));
    assert_eq!(commit.get("promotedCount").and_then(|v| v.as_i64()), Some(0));
    assert_eq!(
        commit.get("errors").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(0)
    );

    // Graduates disappear from active listings.
    assert!(listed_students(&mut sc, json!({ "classLevelId": ss3 })).is_empty());

    let all = listed_students(&mut sc, json!({ "classLevelId": ss3, "includeInactive": true }));
    assert_eq!(all.len(), 2);
    for s in &all {
        assert_eq!(s.get("active").and_then(|v| v.as_bool()), Some(false));
        let date = s.get("graduationDate").and_then(|v| v.as_str()).unwrap_or("");
        assert_eq!(date.len(), 10, "graduation date must be stamped, got {:?}", date);
    }

    drop(sc);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn invalid_transition_is_rejected_before_any_mutation() {
    let workspace = temp_dir("sisd-commit-invalid");
    let (mut child, stdin, reader) = spawn_sidecar();
    let mut sc = Sidecar {
        stdin,
        reader,
        next_id: 0,
    };
    sc.call(
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let jss1 = create_level(&mut sc, "JSS1", 1);
    create_level(&mut sc, "SS1", 4);
    let student = enroll(&mut sc, "Bello", "Kunle", &jss1);

    // Skipping JSS2/JSS3 is not a defined transition.
    let resp = sc.call_raw(
        "promotion.commit",
        json!({ "fromClass": "JSS1", "toClass": "SS1", "studentIds": [student] }),
    );
    assert_eq!(error_code(&resp), "invalid_transition");

    // Leaving school is only defined from SS3.
    let resp = sc.call_raw(
        "promotion.commit",
        json!({ "fromClass": "JSS1", "toClass": "GRADUATED", "studentIds": [student] }),
    );
    assert_eq!(error_code(&resp), "invalid_transition");

    // A class outside the progression has no next step.
    let resp = sc.call_raw(
        "promotion.commit",
        json!({ "fromClass": "PRIMARY6", "toClass": "JSS1", "studentIds": [student] }),
    );
    assert_eq!(error_code(&resp), "invalid_transition");

    let resp = sc.call_raw(
        "promotion.commit",
        json!({ "fromClass": "JSS1", "toClass": "JSS2", "studentIds": [] }),
    );
    assert_eq!(error_code(&resp), "bad_params");

    // Nothing moved.
    let students = listed_students(&mut sc, json!({ "classLevelId": jss1 }));
    assert_eq!(students.len(), 1);
    assert_eq!(
        students[0].get("classLevel").and_then(|v| v.as_str()),
        Some("JSS1")
    );

    drop(sc);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn bad_ids_become_per_student_errors_without_sinking_the_batch() {
    let workspace = temp_dir("sisd-commit-partial");
    let (mut child, stdin, reader) = spawn_sidecar();
    let mut sc = Sidecar {
        stdin,
        reader,
        next_id: 0,
    };
    sc.call(
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let jss1 = create_level(&mut sc, "JSS1", 1);
    let jss2 = create_level(&mut sc, "JSS2", 2);
    let valid = enroll(&mut sc, "Adamu", "Hauwa", &jss1);
    let wrong_class = enroll(&mut sc, "Nwosu", "Emeka", &jss2);

    let commit = sc.call(
        "promotion.commit",
        json!({
            "fromClass": "JSS1",
            "toClass": "JSS2",
            "studentIds": [valid, "ghost-id", wrong_class]
        }),
    );
    assert_eq!(commit.get("promotedCount").and_then(|v| v.as_i64()), Some(1));
    let errors = commit.get("errors").and_then(|v| v.as_array()).unwrap();
    assert_eq!(errors.len(), 2);
    for e in errors {
        assert_eq!(
            e.get("error").and_then(|v| v.as_str()),
            Some("Student not found or not in expected class")
        );
    }
    let error_ids: Vec<&str> = errors
        .iter()
        .map(|e| e.get("studentId").and_then(|v| v.as_str()).unwrap())
        .collect();
    assert!(error_ids.contains(&"ghost-id"));
    assert!(error_ids.contains(&wrong_class.as_str()));

    // The valid student actually moved.
    let moved = listed_students(&mut sc, json!({ "classLevelId": jss2 }));
    assert!(moved
        .iter()
        .any(|s| s.get("id").and_then(|v| v.as_str()) == Some(valid.as_str())));
    assert!(listed_students(&mut sc, json!({ "classLevelId": jss1 })).is_empty());

    drop(sc);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
