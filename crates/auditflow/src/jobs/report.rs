use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use uuid::Uuid;

use crate::error::{AuditError, AuditResult};
use crate::jobs::model::ReportRef;

pub const REPORT_FILE_NAME: &str = "report.txt";

pub fn sha256_hex(data: &[u8]) -> String {
    let hash = Sha256::digest(data);
    format!("{hash:x}")
}

/// Persists final artifacts. The returned reference carries the SHA-256 of
/// exactly the bytes written.
#[async_trait]
pub trait ReportSink: Send + Sync + 'static {
    async fn write(&self, job_id: Uuid, content: &str) -> AuditResult<ReportRef>;

    /// Read the artifact back, failing if its hash no longer matches.
    async fn read(&self, report_ref: &ReportRef) -> AuditResult<String>;
}

/// Stores each report at `<data_dir>/<job_id>/report.txt`.
#[derive(Debug, Clone)]
pub struct FsReportSink {
    data_dir: PathBuf,
}

impl FsReportSink {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn path_for(&self, job_id: Uuid) -> PathBuf {
        self.data_dir.join(job_id.to_string()).join(REPORT_FILE_NAME)
    }
}

#[async_trait]
impl ReportSink for FsReportSink {
    async fn write(&self, job_id: Uuid, content: &str) -> AuditResult<ReportRef> {
        let path = self.path_for(job_id);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        // write then rename so readers never see a partial file
        let tmp = path.with_extension("txt.tmp");
        tokio::fs::write(&tmp, content.as_bytes()).await?;
        tokio::fs::rename(&tmp, &path).await?;

        Ok(ReportRef {
            path: path.to_string_lossy().into_owned(),
            sha256: sha256_hex(content.as_bytes()),
        })
    }

    async fn read(&self, report_ref: &ReportRef) -> AuditResult<String> {
        let bytes = tokio::fs::read(&report_ref.path).await?;
        let actual = sha256_hex(&bytes);
        if actual != report_ref.sha256 {
            return Err(AuditError::Internal(format!(
                "report hash mismatch for {}: expected {}, found {actual}",
                report_ref.path, report_ref.sha256
            )));
        }
        String::from_utf8(bytes)
            .map_err(|e| AuditError::Internal(format!("report is not valid UTF-8: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_produces_known_hash() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[tokio::test]
    async fn write_then_read_verifies_hash() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FsReportSink::new(dir.path());
        let id = Uuid::new_v4();

        let r = sink.write(id, "# report\nbody").await.unwrap();
        assert_eq!(r.sha256, sha256_hex(b"# report\nbody"));
        assert!(r.path.ends_with(&format!("{id}/report.txt")));
        assert_eq!(sink.read(&r).await.unwrap(), "# report\nbody");
    }

    #[tokio::test]
    async fn tampered_report_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FsReportSink::new(dir.path());
        let r = sink.write(Uuid::new_v4(), "original").await.unwrap();

        std::fs::write(&r.path, "tampered").unwrap();
        let err = sink.read(&r).await.unwrap_err();
        assert!(matches!(err, AuditError::Internal(_)));
    }
}
