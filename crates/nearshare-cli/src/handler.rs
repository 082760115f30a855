//! Console platform handler: prints URI events, auto-accepts file transfers
//! into the output directory, and drives a progress bar from the token's
//! received-byte subscription.

use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use nearshare_core::{FileTransferToken, ShareHandler, TransferSink};

use crate::progress::{format_file_size, TransferProgress};

/// Positioned writes into a file on disk.
struct FileSink {
    file: File,
}

#[async_trait]
impl TransferSink for FileSink {
    async fn write_at(&mut self, position: u64, data: &[u8]) -> std::io::Result<()> {
        self.file.seek(SeekFrom::Start(position)).await?;
        self.file.write_all(data).await
    }
}

/// Handler that accepts every inbound transfer.
pub struct ConsoleHandler {
    output_dir: PathBuf,
}

impl ConsoleHandler {
    /// Accept transfers into `output_dir`.
    #[must_use]
    pub fn new(output_dir: PathBuf) -> Self {
        Self { output_dir }
    }

    /// Strip path components so a peer-supplied name cannot escape the
    /// output directory.
    fn sanitize_file_name(name: &str) -> String {
        let base = Path::new(name)
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => part.to_str(),
                _ => None,
            })
            .next_back()
            .unwrap_or("received.bin");
        base.to_string()
    }
}

#[async_trait]
impl ShareHandler for ConsoleHandler {
    async fn on_received_uri(&self, device_name: &str, uri: &str) {
        println!("{device_name} shared a link: {uri}");
    }

    async fn on_file_transfer(&self, token: Arc<FileTransferToken>) {
        let file_name = Self::sanitize_file_name(token.file_name());
        let path = self.output_dir.join(&file_name);

        println!(
            "Receiving {} ({}) -> {}",
            token.file_name(),
            format_file_size(token.total_bytes()),
            path.display()
        );

        let file = match File::create(&path).await {
            Ok(file) => file,
            Err(err) => {
                tracing::error!(%err, path = %path.display(), "cannot create output file");
                token.cancel();
                return;
            }
        };

        let bar = TransferProgress::new(token.total_bytes(), &file_name);
        let mut progress = token.progress();
        let total = token.total_bytes();
        tokio::spawn(async move {
            while progress.changed().await.is_ok() {
                let received = *progress.borrow();
                bar.update(received);
                if received >= total {
                    bar.finish_with_message(format!("Saved {file_name}"));
                    break;
                }
            }
        });

        token.accept(Box::new(FileSink { file }));
    }
}
