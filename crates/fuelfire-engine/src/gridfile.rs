//! Flat numeric text grids exchanged with the engine.

use std::{fmt::Write as _, fs, path::Path};

use fuelfire_core::{Grid, Mosaic};

use crate::{EngineError, ModelPaths};

fn parse_rows(
    path: &Path,
    skip_rows: usize,
    delimiter: Option<char>,
) -> Result<Grid<f64>, EngineError> {
    let text = fs::read_to_string(path).map_err(|err| EngineError::io(path, err))?;
    let mut rows: Vec<Vec<f64>> = Vec::new();
    for (index, line) in text.lines().enumerate().skip(skip_rows) {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let tokens: Box<dyn Iterator<Item = &str> + '_> = match delimiter {
            Some(delim) => Box::new(line.split(delim).map(str::trim)),
            None => Box::new(line.split_whitespace()),
        };
        let row = tokens
            .map(|token| {
                token.parse::<f64>().map_err(|err| EngineError::Grid {
                    path: path.to_path_buf(),
                    line: index + 1,
                    message: format!("`{token}`: {err}"),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        if let Some(first) = rows.first() {
            if first.len() != row.len() {
                return Err(EngineError::Grid {
                    path: path.to_path_buf(),
                    line: index + 1,
                    message: format!("expected {} values, found {}", first.len(), row.len()),
                });
            }
        }
        rows.push(row);
    }
    Ok(Grid::from_rows(rows)?)
}

/// Read a whitespace-separated integer grid, skipping `skip_rows` header lines.
pub fn read_int_grid(path: &Path, skip_rows: usize) -> Result<Grid<i32>, EngineError> {
    Ok(parse_rows(path, skip_rows, None)?.map(|&value| value as i32))
}

/// Read a comma-delimited integer grid.
pub fn read_delimited_grid(path: &Path, delimiter: char) -> Result<Grid<i32>, EngineError> {
    Ok(parse_rows(path, 0, Some(delimiter))?.map(|&value| value as i32))
}

/// Read an engine burn output: values `<= 0` burned this step.
pub fn read_burn_grid(path: &Path, skip_rows: usize) -> Result<Grid<bool>, EngineError> {
    Ok(parse_rows(path, skip_rows, None)?.map(|&value| value <= 0.0))
}

/// Write an integer grid with four-character right-aligned fields.
pub fn write_int_grid(path: &Path, grid: &Grid<i32>) -> Result<(), EngineError> {
    let mut out = String::with_capacity(grid.len() * 5);
    for row in grid.iter_rows() {
        for (i, value) in row.iter().enumerate() {
            if i > 0 {
                out.push(' ');
            }
            let _ = write!(out, "{value:4}");
        }
        out.push('\n');
    }
    fs::write(path, out).map_err(|err| EngineError::io(path, err))
}

/// Load the engine's current age and fuel inputs.
pub fn read_mosaic(paths: &ModelPaths) -> Result<Mosaic, EngineError> {
    let age = read_int_grid(&paths.age(), 0)?;
    let fuel = read_int_grid(&paths.fuel(), 0)?;
    Ok(Mosaic::new(age, fuel)?)
}

/// Replace the engine's age and fuel inputs.
pub fn write_mosaic(paths: &ModelPaths, mosaic: &Mosaic) -> Result<(), EngineError> {
    write_int_grid(&paths.age(), &mosaic.age)?;
    write_int_grid(&paths.fuel(), &mosaic.fuel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn int_grid_round_trips_through_text() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("AGEPIX.DAT");
        let grid = Grid::from_rows(vec![vec![0, 12, 254], vec![7, 1000, 3]]).unwrap();
        write_int_grid(&path, &grid).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().next(), Some("   0   12  254"));
        assert_eq!(read_int_grid(&path, 0).unwrap(), grid);
    }

    #[test]
    fn burn_grid_skips_header_and_thresholds_at_zero() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("BURNT0OUT.TXT");
        let text = "ncols 3\nnrows 2\nxll 0\nyll 0\ncell 1\nnodata -9999\n0 1 -1\n5 0 2\n";
        fs::write(&path, text).unwrap();

        let burned = read_burn_grid(&path, 6).unwrap();
        assert_eq!(
            burned,
            Grid::from_rows(vec![vec![true, false, true], vec![false, true, false]]).unwrap()
        );
    }

    #[test]
    fn ragged_rows_are_reported_with_line_numbers() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.dat");
        fs::write(&path, "1 2 3\n4 5\n").unwrap();
        match read_int_grid(&path, 0) {
            Err(EngineError::Grid { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected grid error, got {other:?}"),
        }
    }

    #[test]
    fn delimited_grid_parses_commas() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("age.csv");
        fs::write(&path, "1, 2,3\n4,5,6\n").unwrap();
        let grid = read_delimited_grid(&path, ',').unwrap();
        assert_eq!(grid.shape(), (2, 3));
        assert_eq!(grid.cells(), &[1, 2, 3, 4, 5, 6]);
    }
}
