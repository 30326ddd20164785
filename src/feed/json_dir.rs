//! Fixture feed reading chapters from a directory of JSON files

use super::{ChapterSource, FeedError, FeedResult, SourceFeed};
use async_trait::async_trait;
use std::path::PathBuf;

/// A feed backed by a directory of `chapter_<n>.json` files
///
/// Each file holds one serialized [`ChapterSource`]. This is the operator
/// surface for offline corpora and the test double for the scraping layer.
pub struct JsonDirFeed {
    dir: PathBuf,
}

impl JsonDirFeed {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, chapter: u32) -> PathBuf {
        self.dir.join(format!("chapter_{chapter}.json"))
    }
}

#[async_trait]
impl SourceFeed for JsonDirFeed {
    async fn fetch(&self, chapter: u32) -> FeedResult<ChapterSource> {
        let path = self.path_for(chapter);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FeedError::NotFound(chapter));
            }
            Err(e) => return Err(FeedError::Io(e)),
        };

        let source: ChapterSource = serde_json::from_str(&raw)
            .map_err(|e| FeedError::Malformed(format!("{}: {e}", path.display())))?;

        if source.number != chapter {
            return Err(FeedError::Malformed(format!(
                "{} declares chapter {}, expected {}",
                path.display(),
                source.number,
                chapter
            )));
        }

        Ok(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::Mention;

    fn write_chapter(dir: &std::path::Path, source: &ChapterSource) {
        let path = dir.join(format!("chapter_{}.json", source.number));
        std::fs::write(path, serde_json::to_string(source).unwrap()).unwrap();
    }

    #[tokio::test]
    async fn fetches_chapter_file() {
        let dir = tempfile::tempdir().unwrap();
        let source = ChapterSource {
            number: 1,
            title: "Romance Dawn".to_string(),
            arc_name: Some("East Blue".to_string()),
            text: "Luffy sets out to sea.".to_string(),
            mentions: vec![Mention::new("Luffy", "/wiki/Monkey_D._Luffy")],
        };
        write_chapter(dir.path(), &source);

        let feed = JsonDirFeed::new(dir.path());
        let fetched = feed.fetch(1).await.unwrap();
        assert_eq!(fetched, source);
    }

    #[tokio::test]
    async fn missing_chapter_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let feed = JsonDirFeed::new(dir.path());
        let err = feed.fetch(42).await.unwrap_err();
        assert!(matches!(err, FeedError::NotFound(42)));
    }

    #[tokio::test]
    async fn number_mismatch_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let source = ChapterSource {
            number: 7,
            title: "Seven".to_string(),
            arc_name: None,
            text: "text".to_string(),
            mentions: vec![],
        };
        // Written under the wrong file name.
        let path = dir.path().join("chapter_8.json");
        std::fs::write(path, serde_json::to_string(&source).unwrap()).unwrap();

        let feed = JsonDirFeed::new(dir.path());
        let err = feed.fetch(8).await.unwrap_err();
        assert!(matches!(err, FeedError::Malformed(_)));
    }

    #[tokio::test]
    async fn garbage_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("chapter_3.json"), "{not json").unwrap();

        let feed = JsonDirFeed::new(dir.path());
        let err = feed.fetch(3).await.unwrap_err();
        assert!(matches!(err, FeedError::Malformed(_)));
    }
}
