//! Bidirectional stdio attachment for the Stdio Bridge: a writer onto the
//! container's stdin and a demuxed reader off its stdout.
use bollard::container::LogOutput;
use bollard::Docker;
use futures::stream::StreamExt;
use sandbox_core::stdio_bridge::StdioTransport;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

pub struct ContainerStdioTransport {
    input: Mutex<Box<dyn tokio::io::AsyncWrite + Unpin + Send>>,
    output: Mutex<std::pin::Pin<Box<dyn futures::Stream<Item = Result<LogOutput, bollard::errors::Error>> + Send>>>,
    /// Bytes already read off the stream past the newline returned by the
    /// previous call — a single chunk from the stream can contain more
    /// than one line, so this must survive across `read_line` calls.
    pending: Mutex<String>,
}

impl ContainerStdioTransport {
    pub async fn attach(docker: &Docker, container_id: &str) -> anyhow::Result<Self> {
        use bollard::container::AttachContainerOptions;

        let attach = docker
            .attach_container(
                container_id,
                Some(AttachContainerOptions::<String> {
                    stdin: Some(true),
                    stdout: Some(true),
                    stderr: Some(true),
                    stream: Some(true),
                    logs: Some(false),
                    ..Default::default()
                }),
            )
            .await?;

        Ok(Self {
            input: Mutex::new(Box::new(attach.input)),
            output: Mutex::new(Box::pin(attach.output)),
            pending: Mutex::new(String::new()),
        })
    }
}

#[async_trait::async_trait]
impl StdioTransport for ContainerStdioTransport {
    async fn write_line(&self, line: &str) -> std::io::Result<()> {
        let mut input = self.input.lock().await;
        input.write_all(line.as_bytes()).await?;
        input.write_all(b"\n").await?;
        input.flush().await
    }

    async fn read_line(&self) -> std::io::Result<Option<String>> {
        let mut pending = self.pending.lock().await;
        if let Some(pos) = pending.find('\n') {
            let line = pending[..=pos].to_string();
            pending.drain(..=pos);
            return Ok(Some(line));
        }

        let mut output = self.output.lock().await;
        loop {
            match output.next().await {
                Some(Ok(LogOutput::StdOut { message })) => {
                    pending.push_str(&String::from_utf8_lossy(&message));
                    if let Some(pos) = pending.find('\n') {
                        let line = pending[..=pos].to_string();
                        pending.drain(..=pos);
                        return Ok(Some(line));
                    }
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(std::io::Error::new(std::io::ErrorKind::Other, e)),
                None => {
                    if pending.is_empty() {
                        return Ok(None);
                    }
                    let line = std::mem::take(&mut *pending);
                    return Ok(Some(line));
                }
            }
        }
    }
}
