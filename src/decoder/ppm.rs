use tokio::io::{AsyncRead, AsyncReadExt};

#[derive(Debug)]
pub(crate) struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum PpmError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed header: {0}")]
    Header(String),
    #[error("frame data truncated after {read} of {expected} bytes")]
    Truncated { read: usize, expected: usize },
    #[error("frame of {width}x{height} exceeds the limit of {max_pixels} pixels")]
    TooLarge {
        width: u32,
        height: u32,
        max_pixels: u64,
    },
}

async fn next_token<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<String>, PpmError> {
    let mut token = Vec::new();
    loop {
        let byte = match reader.read_u8().await {
            Ok(byte) => byte,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        };
        if byte == b'#' && token.is_empty() {
            // comment runs to end of line
            loop {
                match reader.read_u8().await {
                    Ok(b'\n') => break,
                    Ok(_) => continue,
                    Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                    Err(e) => return Err(e.into()),
                }
            }
            continue;
        }
        if byte.is_ascii_whitespace() {
            if token.is_empty() {
                continue;
            }
            break;
        }
        token.push(byte);
    }

    if token.is_empty() {
        return Ok(None);
    }
    String::from_utf8(token)
        .map(Some)
        .map_err(|_| PpmError::Header("non-ascii token".into()))
}

async fn header_number<R: AsyncRead + Unpin>(
    reader: &mut R,
    field: &str,
) -> Result<u32, PpmError> {
    let token = next_token(reader)
        .await?
        .ok_or_else(|| PpmError::Header(format!("missing {}", field)))?;
    token
        .parse()
        .map_err(|_| PpmError::Header(format!("invalid {} `{}`", field, token)))
}

/// Reads the next binary (`P6`) PPM image from a concatenated stream.
/// Returns `Ok(None)` on a clean end of stream between images. The header is
/// checked against `max_pixels` before any pixel buffer is allocated.
pub(crate) async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_pixels: u64,
) -> Result<Option<RawFrame>, PpmError> {
    let magic = match next_token(reader).await? {
        Some(magic) => magic,
        None => return Ok(None),
    };
    if magic != "P6" {
        return Err(PpmError::Header(format!("unexpected magic `{}`", magic)));
    }

    let width = header_number(reader, "width").await?;
    let height = header_number(reader, "height").await?;
    let max_value = header_number(reader, "max value").await?;

    if width == 0 || height == 0 {
        return Err(PpmError::Header(format!(
            "unsupported dimensions {}x{}",
            width, height
        )));
    }
    if u64::from(width) * u64::from(height) > max_pixels {
        return Err(PpmError::TooLarge {
            width,
            height,
            max_pixels,
        });
    }
    if max_value != 255 {
        return Err(PpmError::Header(format!(
            "only 8-bit samples are supported, max value is {}",
            max_value
        )));
    }

    let expected = width as usize * height as usize * 3;
    let mut pixels = vec![0u8; expected];
    let mut read = 0;
    while read < expected {
        let n = reader.read(&mut pixels[read..]).await?;
        if n == 0 {
            return Err(PpmError::Truncated { read, expected });
        }
        read += n;
    }

    Ok(Some(RawFrame {
        width,
        height,
        pixels,
    }))
}
