use std::fs::File;
use std::path::Path;
use std::io::{self, BufRead, BufReader, Write};
use crate::points::PointSet;

/// Read a whitespace-separated coordinate file and output a PointSet.
///
/// Every non-comment line holds the coordinates of one point (`x y ...`),
/// with an extra trailing weight column when `weighted` is set. Lines
/// starting with `%` or `#` are skipped. The first data line fixes the
/// number of columns.
pub fn read_points_file(
    file_path: &Path,
    weighted: bool,
) -> io::Result<(PointSet, Option<Vec<f64>>)> {
    let file = File::open(file_path)?;
    let reader = BufReader::new(file);

    let mut columns: Option<usize> = None;
    let mut coords: Vec<Vec<f64>> = Vec::new();
    let mut weights: Vec<f64> = Vec::new();

    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('%') || trimmed.starts_with('#') {
            continue;
        }

        let values: Vec<f64> = trimmed
            .split_whitespace()
            .map(|field| {
                field.parse::<f64>().map_err(|e| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("line {}: {}", line_no + 1, e),
                    )
                })
            })
            .collect::<io::Result<_>>()?;

        let expected = *columns.get_or_insert(values.len());
        if values.len() != expected {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "line {}: expected {} columns, got {}",
                    line_no + 1,
                    expected,
                    values.len()
                ),
            ));
        }

        let dim = if weighted { expected - 1 } else { expected };
        if dim == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("line {}: no coordinate columns", line_no + 1),
            ));
        }
        if coords.is_empty() {
            coords = vec![Vec::new(); dim];
        }

        for (axis, &value) in coords.iter_mut().zip(values.iter()) {
            axis.push(value);
        }
        if weighted {
            weights.push(values[expected - 1]);
        }
    }

    let points = PointSet::new(coords)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    let weights = if weighted { Some(weights) } else { None };
    Ok((points, weights))
}

/// Write the partition array to a file.
pub fn write_partition_data_to_file(partition: &[usize], file_name: &str) -> std::io::Result<()> {
    let mut file = File::create(file_name)?;
    for point_id in 0..partition.len() {
        writeln!(file, "point {} => part {}", point_id, partition[point_id])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::Write;
    use std::path::Path;
    use tempfile::tempdir;
    use crate::io::read_points_file;

    fn create_mock_file(dir: &Path, filename: &str, content: &str) -> String {
        let file_path = dir.join(filename);
        let mut file = File::create(&file_path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file_path.to_str().unwrap().to_string()
    }

    #[test]
    fn test_read_points_file() -> Result<(), std::io::Error> {
        // Arrange
        let temp_dir = tempdir()?;
        let content = "% 2d points\n0.0 1.0\n2.0 3.0\n4.0 5.0\n";
        let points_file_path = create_mock_file(temp_dir.path(), "points.txt", content);

        // Act
        let (points, weights) = read_points_file(Path::new(&points_file_path), false).unwrap();

        // Assert
        assert_eq!(points.len(), 3);
        assert_eq!(points.dim(), 2);
        assert_eq!(points.axis(0), &[0.0, 2.0, 4.0]);
        assert_eq!(points.axis(1), &[1.0, 3.0, 5.0]);
        assert!(weights.is_none());

        Ok(())
    }

    #[test]
    fn test_read_weighted_points_file() -> Result<(), std::io::Error> {
        // Arrange
        let temp_dir = tempdir()?;
        let content = "1.0 2.0 5.0\n3.0 4.0 7.0\n";
        let points_file_path = create_mock_file(temp_dir.path(), "weighted.txt", content);

        // Act
        let (points, weights) = read_points_file(Path::new(&points_file_path), true).unwrap();

        // Assert
        assert_eq!(points.dim(), 2);
        assert_eq!(weights, Some(vec![5.0, 7.0]));

        Ok(())
    }

    #[test]
    fn test_read_points_file_ragged_columns() -> Result<(), std::io::Error> {
        // Arrange
        let temp_dir = tempdir()?;
        let content = "1.0 2.0\n3.0\n";
        let points_file_path = create_mock_file(temp_dir.path(), "ragged.txt", content);

        // Act
        let result = read_points_file(Path::new(&points_file_path), false);

        // Assert
        assert!(result.is_err());

        Ok(())
    }
}
