//! Position samples typed on stdin, one `lat,lon[,accuracy]` per line.

use futures_util::stream::{self, StreamExt};
use peermap_sync::config::SamplingConfig;
use peermap_sync::position::{Position, PositionError, SampleGate};
use peermap_sync::source::{PositionSource, PositionStream, SourceError};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

#[derive(Debug, PartialEq, Error)]
pub(crate) enum LineError {
    #[error("expected `lat,lon[,accuracy]`, got {0:?}")]
    Format(String),
    #[error(transparent)]
    Position(#[from] PositionError),
}

/// Parse one input line. Blank lines and `#` comments yield `None`.
pub(crate) fn parse_line(line: &str) -> Result<Option<Position>, LineError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    let number = |s: &str| s.parse::<f64>().map_err(|_| LineError::Format(line.to_string()));
    let position = match fields.as_slice() {
        [lat, lon] => Position::now(number(lat)?, number(lon)?)?,
        [lat, lon, accuracy] => Position::now(number(lat)?, number(lon)?)?.with_accuracy(number(accuracy)?)?,
        _ => return Err(LineError::Format(line.to_string())),
    };
    Ok(Some(position))
}

/// Line-oriented position source, throttled like a device GPS feed.
pub(crate) struct LineSource<R> {
    reader: R,
    gate: SampleGate,
}

impl LineSource<BufReader<tokio::io::Stdin>> {
    pub(crate) fn stdin(sampling: &SamplingConfig) -> Self {
        Self::new(BufReader::new(tokio::io::stdin()), sampling)
    }
}

impl<R> LineSource<R> {
    pub(crate) fn new(reader: R, sampling: &SamplingConfig) -> Self {
        Self {
            reader,
            gate: SampleGate::new(sampling),
        }
    }
}

impl<R> PositionSource for LineSource<R>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    async fn start(self) -> Result<PositionStream, SourceError> {
        let lines = self.reader.lines();
        let samples = stream::unfold((lines, self.gate), |(mut lines, mut gate)| async move {
            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => return None,
                    Err(e) => {
                        log::warn!("Position input failed: {e}");
                        return None;
                    }
                };
                match parse_line(&line) {
                    Ok(Some(sample)) if gate.admit(&sample) => return Some((sample, (lines, gate))),
                    Ok(Some(_)) => log::debug!("Sample throttled"),
                    Ok(None) => {}
                    Err(e) => log::warn!("Ignoring input line: {e}"),
                }
            }
        });
        Ok(samples.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line() {
        let position = parse_line("-12.05, -77.04").unwrap().unwrap();
        assert_eq!(position.coordinates(), (-12.05, -77.04));
        assert_eq!(position.accuracy(), None);

        let position = parse_line("1.5,2.5,12").unwrap().unwrap();
        assert_eq!(position.accuracy(), Some(12.0));

        assert_eq!(parse_line("   "), Ok(None));
        assert_eq!(parse_line("# home"), Ok(None));
    }

    #[test]
    fn test_parse_line_rejects() {
        assert!(matches!(parse_line("12.05"), Err(LineError::Format(_))));
        assert!(matches!(parse_line("a,b"), Err(LineError::Format(_))));
        assert!(matches!(parse_line("1,2,3,4"), Err(LineError::Format(_))));
        assert_eq!(
            parse_line("95,0"),
            Err(LineError::Position(PositionError::LatitudeOutOfRange(95.0)))
        );
    }

    #[tokio::test]
    async fn test_line_source_skips_bad_lines() {
        let input: &[u8] = b"-12.05,-77.04\nnot a position\n\n";
        let source = LineSource::new(BufReader::new(input), &SamplingConfig::default());
        let samples: Vec<Position> = source.start().await.unwrap().collect().await;

        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].coordinates(), (-12.05, -77.04));
    }
}
