use crate::{OperationLog, Result, SrError};
use uuid::Uuid;

#[tokio::test]
async fn test_operation_log_records_outcomes() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let repository = Uuid::new_v4();
    let log = OperationLog::new(&dir.path().join("log"), &repository);
    assert_eq!(log.path(), dir.path().join("log").join(format!("{repository}.log")));

    log.succeeded("sr_attach", "").await?;
    log.succeeded("vdi_create", "size=1048576").await?;
    let err = SrError::StillMapped {
        image: "vms/vdi-1".to_string(),
        refcount: 2,
    };
    log.failed("vdi_delete", &err).await?;

    let content = tokio::fs::read_to_string(log.path()).await?;
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].ends_with(" OK     sr_attach"), "{}", lines[0]);
    assert!(lines[1].ends_with(" OK     vdi_create size=1048576"), "{}", lines[1]);
    assert!(
        lines[2].contains(" FAILED vdi_delete StillMapped: "),
        "{}",
        lines[2]
    );
    assert!(lines[2].contains("vms/vdi-1"));

    // multi-line tool output stays on one line
    let err = SrError::Unknown {
        operation: "resize image".to_string(),
        target: "vms/vdi-1".to_string(),
        detail: "rbd: error\nsecond line".to_string(),
    };
    log.failed("vdi_resize", &err).await?;
    let content = tokio::fs::read_to_string(log.path()).await?;
    assert_eq!(content.lines().count(), 4);

    Ok(())
}
