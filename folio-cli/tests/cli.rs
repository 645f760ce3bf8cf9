use assert_cmd::Command;

// Argument handling only: none of these paths reach the rendering engine, so
// they run without a pdfium library installed.

#[test]
fn help_lists_the_subcommands() {
    let output = Command::cargo_bin("folio")
        .unwrap()
        .arg("--help")
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("render"));
    assert!(stdout.contains("info"));
    assert!(stdout.contains("recent"));
}

#[test]
fn render_requires_a_file_argument() {
    let output = Command::cargo_bin("folio")
        .unwrap()
        .arg("render")
        .output()
        .unwrap();
    assert!(!output.status.success());
}

#[test]
fn zoom_and_fit_flags_conflict() {
    let output = Command::cargo_bin("folio")
        .unwrap()
        .args(["render", "doc.pdf", "--zoom", "2", "--fit-width", "800"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("cannot be used with"));
}

#[test]
fn malformed_viewport_is_rejected() {
    let output = Command::cargo_bin("folio")
        .unwrap()
        .args(["render", "doc.pdf", "--fit-page", "not-a-size"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("WIDTHxHEIGHT"));
}
