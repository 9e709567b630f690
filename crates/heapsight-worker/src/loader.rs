use heapsight_types::ProfileUid;

use crate::WorkerError;
use crate::snapshot::HeapSnapshot;

/// Accumulates streamed snapshot text until the writer closes it.
pub struct SnapshotLoader {
    profile_uid: ProfileUid,
    buffer: String,
    closed: bool,
}

impl SnapshotLoader {
    pub fn new(profile_uid: ProfileUid) -> Self {
        Self {
            profile_uid,
            buffer: String::new(),
            closed: false,
        }
    }

    pub fn write(&mut self, chunk: &str) -> Result<(), WorkerError> {
        if self.closed {
            return Err(WorkerError::LoaderClosed);
        }
        self.buffer.push_str(chunk);
        Ok(())
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn build_snapshot(&mut self, progress: &mut dyn FnMut(&str)) -> Result<HeapSnapshot, WorkerError> {
        if !self.closed {
            return Err(WorkerError::LoaderNotClosed);
        }
        let text = std::mem::take(&mut self.buffer);
        HeapSnapshot::build(self.profile_uid, &text, progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SnapshotBuilder;

    fn uid() -> ProfileUid {
        ProfileUid::new(4).expect("non-zero uid")
    }

    #[test]
    fn chunks_are_joined_before_parsing() {
        let mut builder = SnapshotBuilder::new();
        let a = builder.object("A", 12);
        builder.property(SnapshotBuilder::ROOT, a, "a");
        let text = builder.to_json();

        let mut loader = SnapshotLoader::new(uid());
        let (head, tail) = text.split_at(text.len() / 3);
        loader.write(head).expect("open loader");
        loader.write(tail).expect("open loader");
        assert_eq!(loader.buffered_len(), text.len());
        loader.close();

        let snapshot = loader.build_snapshot(&mut |_| {}).expect("builds");
        assert_eq!(snapshot.static_data().node_count, 2);
        assert_eq!(snapshot.profile_uid(), uid());
    }

    #[test]
    fn writes_after_close_and_early_builds_fail() {
        let mut loader = SnapshotLoader::new(uid());
        assert!(matches!(
            loader.build_snapshot(&mut |_| {}),
            Err(WorkerError::LoaderNotClosed)
        ));
        loader.close();
        assert_eq!(loader.write("{}"), Err(WorkerError::LoaderClosed));
    }
}
