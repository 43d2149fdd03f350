use std::{
    fs::File,
    io::{self, BufRead},
    path::Path,
};

/// Reads one label per line. A line may carry a trailing `,r,g,b` display
/// color, which is validated and otherwise ignored.
pub fn load_labels(filepath: &Path) -> io::Result<Vec<String>> {
    let file = File::open(filepath)?;
    let reader = io::BufReader::new(file);
    let mut labels = Vec::new();

    for line_result in reader.lines() {
        let line = line_result?;
        if line.trim().is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.split(',').collect();

        match parts.len() {
            1 => labels.push(parts[0].trim().to_string()),
            4 => {
                for channel in &parts[1..] {
                    channel.trim().parse::<u8>().map_err(|_| {
                        io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("Invalid color value in line: {}", line),
                        )
                    })?;
                }
                labels.push(parts[0].trim().to_string());
            }
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("Invalid line format: {}", line),
                ))
            }
        }
    }

    Ok(labels)
}

pub fn label_for(labels: &[String], class_id: usize) -> String {
    labels
        .get(class_id)
        .cloned()
        .unwrap_or_else(|| format!("class_{}", class_id))
}
