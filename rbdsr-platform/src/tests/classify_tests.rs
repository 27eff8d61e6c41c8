use crate::command::{CommandOutput, Tool, ToolInvocation, classify};
use crate::Outcome;
use rbdsr_core::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;

#[test]
fn test_classify_success_ignores_stderr() {
    assert_eq!(
        classify(Tool::Rbd, Some(0), "warning: deprecated option"),
        Outcome::Success
    );
}

#[test]
fn test_classify_rbd_stderr_patterns() {
    let cases = [
        (
            "rbd: error opening image vdi-1: (2) No such file or directory",
            Outcome::NotFound,
        ),
        ("rbd: create error: (17) File exists", Outcome::AlreadyExists),
        (
            "rbd: sysfs write failed\nrbd: unmap failed: (16) Device or resource busy",
            Outcome::Busy,
        ),
        (
            "rbd: error: image still has watchers",
            Outcome::Busy,
        ),
        (
            "monclient: authenticate failed: (13) Permission denied",
            Outcome::PermissionDenied,
        ),
        ("rbd: create error: (122) Disk quota exceeded", Outcome::QuotaExceeded),
        (
            "monclient: connect timed out (110) Connection timed out",
            Outcome::Timeout,
        ),
        ("Error ENOENT: unrecognized pool 'vms'", Outcome::NotFound),
    ];

    for (stderr, expected) in cases {
        assert_eq!(classify(Tool::Rbd, Some(1), stderr), expected, "{stderr}");
    }
}

#[test]
fn test_classify_falls_back_to_errno_exit_code() {
    assert_eq!(classify(Tool::Rbd, Some(2), ""), Outcome::NotFound);
    assert_eq!(classify(Tool::Ceph, Some(16), "oops"), Outcome::Busy);
    assert_eq!(classify(Tool::Rbd, Some(17), ""), Outcome::AlreadyExists);
    assert_eq!(classify(Tool::Ceph, Some(122), ""), Outcome::QuotaExceeded);

    // lvm exit codes are not errno values
    assert!(matches!(classify(Tool::Lvm, Some(2), ""), Outcome::Unknown(_)));
}

#[test]
fn test_classify_lvm_messages() {
    assert_eq!(
        classify(Tool::Lvm, Some(5), "  Volume group \"VG_RBDSR-x\" not found"),
        Outcome::NotFound
    );
    assert_eq!(
        classify(Tool::Lvm, Some(5), "  A volume group called VG already exists."),
        Outcome::AlreadyExists
    );
    assert_eq!(
        classify(
            Tool::Lvm,
            Some(5),
            "  Logical volume VG/LV-1 in use."
        ),
        Outcome::Busy
    );
}

#[test]
fn test_classify_unknown_keeps_stderr() {
    match classify(
        Tool::Rbd,
        Some(39),
        "rbd: image has snapshots - these must be deleted",
    ) {
        Outcome::Unknown(detail) => assert!(detail.contains("image has snapshots")),
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[test]
fn test_into_result_maps_outcomes_to_errors() {
    let timeout = Duration::from_secs(7);

    let output = CommandOutput::success("/dev/rbd0\n");
    assert_eq!(
        output.into_result("map", "vms/vdi-1", timeout).unwrap(),
        "/dev/rbd0\n"
    );

    let err = CommandOutput::timed_out()
        .into_result("map", "vms/vdi-1", timeout)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(err.is_retryable());
    assert!(err.to_string().contains("7s"));

    let err = CommandOutput::from_process(
        Tool::Rbd,
        Some(13),
        String::new(),
        "(13) Permission denied".to_string(),
    )
    .into_result("ls", "vms", timeout)
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    assert!(err.to_string().contains("Permission denied"));

    let err = CommandOutput::from_process(
        Tool::Rbd,
        Some(39),
        String::new(),
        "rbd: image has snapshots".to_string(),
    )
    .into_result("rm", "vms/vdi-1", timeout)
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unknown);
    assert!(err.to_string().contains("vms/vdi-1"));
}

#[test]
fn test_invocation_helpers() {
    let invocation = ToolInvocation {
        tool: Tool::Rbd,
        program: PathBuf::from("/usr/bin/rbd"),
        args: vec![
            "create".to_string(),
            "vms/vdi-1".to_string(),
            "--size".to_string(),
            "1024M".to_string(),
        ],
        env: vec![("LVM_SYSTEM_DIR".to_string(), "/etc/lvm/x".to_string())],
        timeout: Duration::from_secs(1),
    };

    assert_eq!(invocation.command_line(), "/usr/bin/rbd create vms/vdi-1 --size 1024M");
    assert_eq!(invocation.flag_value("--size"), Some("1024M"));
    assert!(invocation.has_flag("create"));
    assert_eq!(invocation.env_var("LVM_SYSTEM_DIR"), Some("/etc/lvm/x"));
    assert_eq!(invocation.env_var("HOME"), None);
}
