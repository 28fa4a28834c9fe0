//! The assembler CLI compiles source to the exact wire image.

use std::fs;
use std::path::PathBuf;
use std::process::Command;

fn temp_path(name: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("duelchain-asm-{}-{name}", std::process::id()));
    path
}

#[test]
fn compiles_source_to_big_endian_image() {
    let source_path = temp_path("lock.asm");
    let output_path = temp_path("lock.bin");
    fs::write(
        &source_path,
        "# lock: succeed when the first hash word is zero\n\
         lw  r1, r0, 0\n\
         beq r1, r0, 1\n\
         irq failure\n\
         irq success\n",
    )
    .unwrap();

    let status = Command::new(env!("CARGO_BIN_EXE_asm"))
        .arg(&source_path)
        .arg("-o")
        .arg(&output_path)
        .status()
        .expect("asm binary should run");
    assert!(status.success());

    let image = fs::read(&output_path).unwrap();
    // lw r1,r0,0 ; beq r1,r0,1 ; irq failure ; irq success
    assert_eq!(image, vec![0xA4, 0x00, 0xC4, 0x01, 0xE1, 0x01, 0xE0, 0x01]);

    let _ = fs::remove_file(&source_path);
    let _ = fs::remove_file(&output_path);
}

#[test]
fn reports_assembly_errors_as_caret_diagnostics() {
    let source_path = temp_path("broken.asm");
    fs::write(&source_path, "nop\naddi r1, r1, 999\n").unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_asm"))
        .arg(&source_path)
        .output()
        .expect("asm binary should run");
    assert!(!output.status.success());

    // Compiler-style shape: message, file:line:column pointer, excerpt,
    // caret under the offending immediate (column 14).
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("error: "));
    assert!(stderr.contains("out of range"));
    assert!(stderr.contains(&format!(" --> {}:2:14", source_path.display())));
    assert!(stderr.contains("   2 | addi r1, r1, 999"));
    assert!(stderr.contains(&format!("  | {}^", " ".repeat(13))));

    let _ = fs::remove_file(&source_path);
}
