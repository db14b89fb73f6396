use std::sync::Arc;

use crate::error::{AdapterError, AttributeWriteError};
use crate::events::Digest;
use crate::repository::RepositoryClient;

/// Records, reads and clears the thumbnail digest on a source revision.
#[derive(Clone)]
pub struct AttributeWriter {
    client: Arc<dyn RepositoryClient>,
    attribute_name: String,
}

impl std::fmt::Debug for AttributeWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttributeWriter")
            .field("attribute_name", &self.attribute_name)
            .finish_non_exhaustive()
    }
}

impl AttributeWriter {
    pub fn new(
        client: Arc<dyn RepositoryClient>,
        attribute_name: impl Into<String>,
    ) -> Self {
        Self {
            client,
            attribute_name: attribute_name.into(),
        }
    }

    /// Digest `thumbnail` and write it on `path#revision`. Not retried: the
    /// change cursor has already moved past this revision.
    pub async fn write(
        &self,
        path: &str,
        revision: u32,
        thumbnail: &[u8],
    ) -> Result<Digest, AttributeWriteError> {
        let digest = Digest::of(thumbnail);
        self.client
            .write_attribute(
                path,
                revision,
                &self.attribute_name,
                digest.as_str(),
            )
            .await?;
        Ok(digest)
    }

    /// Digest already recorded on `path#revision`, if any.
    pub async fn current(
        &self,
        path: &str,
        revision: u32,
    ) -> Result<Option<String>, AdapterError> {
        self.client
            .read_attribute(path, revision, &self.attribute_name)
            .await
    }

    pub async fn clear(
        &self,
        path: &str,
        revision: u32,
    ) -> Result<(), AttributeWriteError> {
        self.client
            .clear_attribute(path, revision, &self.attribute_name)
            .await?;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.attribute_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryRepository;

    #[tokio::test]
    async fn writes_uppercase_md5_under_the_configured_name() {
        let repo = Arc::new(InMemoryRepository::new());
        let event = repo.submit("//depot/a.png", "binary", b"source".to_vec());
        let writer = AttributeWriter::new(repo.clone(), "thumb");

        let digest = writer
            .write(&event.path, event.revision, b"thumb-bytes")
            .await
            .unwrap();

        assert_eq!(digest, Digest::of(b"thumb-bytes"));
        assert_eq!(digest.as_str().len(), 32);
        assert_eq!(
            repo.attribute("//depot/a.png", 1, "thumb").as_deref(),
            Some(digest.as_str())
        );
    }

    #[tokio::test]
    async fn adapter_failures_surface_as_write_errors() {
        let repo = Arc::new(InMemoryRepository::new());
        let writer = AttributeWriter::new(repo, "thumb");

        let err = writer.write("//depot/none.png", 1, b"x").await.unwrap_err();
        assert!(err.to_string().starts_with("attribute write failed"));
    }

    #[tokio::test]
    async fn current_value_is_read_back_and_cleared() {
        let repo = Arc::new(InMemoryRepository::new());
        repo.submit("//depot/a.png", "binary", b"source".to_vec());
        let writer = AttributeWriter::new(repo.clone(), "thumb");

        assert_eq!(writer.current("//depot/a.png", 1).await.unwrap(), None);
        let digest = writer.write("//depot/a.png", 1, b"t").await.unwrap();
        assert_eq!(
            writer.current("//depot/a.png", 1).await.unwrap().as_deref(),
            Some(digest.as_str())
        );

        writer.clear("//depot/a.png", 1).await.unwrap();
        assert_eq!(writer.current("//depot/a.png", 1).await.unwrap(), None);
        assert_eq!(repo.cleared_attributes()[0].name, "thumb");
    }
}
