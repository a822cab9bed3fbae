use futures::{Stream, StreamExt};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio_stream::wrappers::LinesStream;

use crate::envelope::{Envelope, ProtocolError};

/// Decode newline-delimited envelopes. Blank lines are skipped; every other
/// line yields either an envelope or the reason it was rejected.
pub fn read_envelopes<R>(reader: R) -> impl Stream<Item = Result<Envelope, ProtocolError>>
where
    R: AsyncBufRead + Unpin,
{
    LinesStream::new(reader.lines()).filter_map(|line| async move {
        match line {
            Ok(line) if line.trim().is_empty() => None,
            Ok(line) => Some(Envelope::decode(line.trim())),
            Err(err) => Some(Err(ProtocolError::Io(err))),
        }
    })
}

pub async fn write_envelope<W>(writer: &mut W, envelope: &Envelope) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let mut line = envelope.encode()?.into_bytes();
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EnvelopeKind;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn reads_lines_and_reports_bad_ones_in_place() {
        let input = concat!(
            r#"{"kind":"write-output","payload":{"text":"a"}}"#,
            "\n\n",
            r#"{"kind":"bogus"}"#,
            "\n",
            r#"{"kind":"write-error","payload":{"text":"b"}}"#,
            "\n",
        );
        let results: Vec<_> = read_envelopes(BufReader::new(input.as_bytes()))
            .collect()
            .await;
        assert_eq!(results.len(), 3);
        assert_eq!(
            results[0].as_ref().expect("first").kind,
            EnvelopeKind::WriteOutput
        );
        assert!(matches!(results[1], Err(ProtocolError::UnknownKind(_))));
        assert_eq!(results[2].as_ref().expect("third").text(), Some("b"));
    }

    #[tokio::test]
    async fn written_envelopes_are_one_per_line() {
        let mut buffer = Vec::new();
        write_envelope(&mut buffer, &Envelope::input_response(1, "Ada"))
            .await
            .expect("write");
        write_envelope(&mut buffer, &Envelope::write_output("Hello, Ada"))
            .await
            .expect("write");
        let text = String::from_utf8(buffer).expect("utf8");
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(
            Envelope::decode(lines[0]).expect("decode").value(),
            Some("Ada")
        );
    }
}
