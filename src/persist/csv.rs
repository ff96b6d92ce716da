//! Line-delimited session files. A plain append only ever writes new
//! bytes at the end; inserting a missing header is the one operation
//! that rewrites the file, through a temp file and an atomic rename.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use csv::{ReaderBuilder, WriterBuilder};
use tempfile::NamedTempFile;

use super::{HEADER, PersistError, is_header, parent_dir};

pub(super) fn ensure_header(path: &Path) -> Result<(), PersistError> {
    let empty = match fs::metadata(path) {
        Ok(meta) => meta.len() == 0,
        Err(err) if err.kind() == io::ErrorKind::NotFound => true,
        Err(err) => return Err(PersistError::io(path, err)),
    };
    if empty {
        return write_header(path);
    }
    if first_row_is_header(path)? {
        return Ok(());
    }
    insert_header_above(path)
}

fn write_header(path: &Path) -> Result<(), PersistError> {
    let mut wtr = WriterBuilder::new()
        .has_headers(false)
        .from_path(path)
        .map_err(|e| PersistError::csv(path, e))?;
    wtr.write_record(HEADER)
        .map_err(|e| PersistError::csv(path, e))?;
    wtr.flush().map_err(|e| PersistError::io(path, e))?;
    Ok(())
}

fn first_row_is_header(path: &Path) -> Result<bool, PersistError> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(|e| PersistError::csv(path, e))?;
    match rdr.records().next() {
        Some(Ok(record)) => {
            let cells: Vec<&str> = record.iter().collect();
            Ok(is_header(&cells))
        }
        Some(Err(err)) => Err(PersistError::csv(path, err)),
        None => Ok(false),
    }
}

fn insert_header_above(path: &Path) -> Result<(), PersistError> {
    let mut tmp =
        NamedTempFile::new_in(parent_dir(path)).map_err(|e| PersistError::io(path, e))?;
    {
        let mut wtr = WriterBuilder::new()
            .has_headers(false)
            .from_writer(tmp.as_file_mut());
        wtr.write_record(HEADER)
            .map_err(|e| PersistError::csv(path, e))?;
        wtr.flush().map_err(|e| PersistError::io(path, e))?;
    }
    let mut original = fs::File::open(path).map_err(|e| PersistError::io(path, e))?;
    io::copy(&mut original, tmp.as_file_mut()).map_err(|e| PersistError::io(path, e))?;
    tmp.persist(path)
        .map_err(|e| PersistError::io(path, e.error))?;
    Ok(())
}

pub(super) fn append(path: &Path, records: &[[String; 4]]) -> Result<(), PersistError> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| PersistError::io(path, e))?;
    let mut wtr = WriterBuilder::new().has_headers(false).from_writer(file);
    for record in records {
        wtr.write_record(record)
            .map_err(|e| PersistError::csv(path, e))?;
    }
    wtr.flush().map_err(|e| PersistError::io(path, e))?;
    Ok(())
}

pub(super) fn append_terminal(
    path: &Path,
    records: &[[String; 4]],
    source: &str,
) -> Result<(), PersistError> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| PersistError::io(path, e))?;
    {
        let mut wtr = WriterBuilder::new()
            .has_headers(false)
            .from_writer(&mut file);
        for record in records {
            wtr.write_record(record)
                .map_err(|e| PersistError::csv(path, e))?;
        }
        wtr.flush().map_err(|e| PersistError::io(path, e))?;
    }
    write_footer(&mut file, path, source)
}

pub(super) fn write_snapshot(
    path: &Path,
    records: &[[String; 4]],
    source: &str,
) -> Result<(), PersistError> {
    let mut tmp =
        NamedTempFile::new_in(parent_dir(path)).map_err(|e| PersistError::io(path, e))?;
    {
        let mut wtr = WriterBuilder::new()
            .has_headers(false)
            .from_writer(tmp.as_file_mut());
        wtr.write_record(HEADER)
            .map_err(|e| PersistError::csv(path, e))?;
        for record in records {
            wtr.write_record(record)
                .map_err(|e| PersistError::csv(path, e))?;
        }
        wtr.flush().map_err(|e| PersistError::io(path, e))?;
    }
    write_footer(tmp.as_file_mut(), path, source)?;
    tmp.persist(path)
        .map_err(|e| PersistError::io(path, e.error))?;
    Ok(())
}

fn write_footer(file: &mut fs::File, path: &Path, source: &str) -> Result<(), PersistError> {
    // A record with zero fields is not expressible through the csv
    // writer, so the blank separator goes in as a raw line.
    file.write_all(b"\n").map_err(|e| PersistError::io(path, e))?;
    let label = format!("Command/Source: {source}");
    let mut wtr = WriterBuilder::new().has_headers(false).from_writer(file);
    wtr.write_record(["", "", "", label.as_str()])
        .map_err(|e| PersistError::csv(path, e))?;
    wtr.flush().map_err(|e| PersistError::io(path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::timefmt::parse_elapsed;
    use tempfile::tempdir;

    fn record(time: &str, cpu: &str, ram: &str, source: &str) -> [String; 4] {
        [
            time.to_string(),
            cpu.to_string(),
            ram.to_string(),
            source.to_string(),
        ]
    }

    fn read_all(path: &Path) -> Vec<Vec<String>> {
        let mut rdr = ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_path(path)
            .expect("open csv");
        rdr.records()
            .map(|r| r.expect("record").iter().map(str::to_string).collect())
            .collect()
    }

    #[test]
    fn header_written_to_missing_file() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("out.csv");
        ensure_header(&path).expect("ensure header");
        let rows = read_all(&path);
        assert_eq!(rows.len(), 1, "only the header should exist");
        assert!(is_header(&rows[0]), "first row should be the header");
    }

    #[test]
    fn header_written_to_empty_file() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("out.csv");
        fs::write(&path, "").expect("touch");
        ensure_header(&path).expect("ensure header");
        assert!(is_header(&read_all(&path)[0]));
    }

    #[test]
    fn existing_header_left_untouched() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("out.csv");
        ensure_header(&path).expect("first ensure");
        append(&path, &[record("0:00:01.000", "4.00", "100.00", "job")]).expect("append");
        let before = fs::read(&path).expect("read");
        ensure_header(&path).expect("second ensure");
        let after = fs::read(&path).expect("read");
        assert_eq!(before, after, "a headed file must not be rewritten");
    }

    #[test]
    fn padded_header_recognized() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("out.csv");
        fs::write(
            &path,
            "Time (H:MM:SS.ms), CPU (%), RAM (MB), Source\n0:00:01.000,4.00,100.00,job\n",
        )
        .expect("seed");
        let before = fs::read(&path).expect("read");
        ensure_header(&path).expect("ensure");
        assert_eq!(before, fs::read(&path).expect("read"));
    }

    #[test]
    fn header_inserted_above_existing_data() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("out.csv");
        fs::write(&path, "0:00:01.000,4.00,100.00,job\n").expect("seed");
        ensure_header(&path).expect("ensure");
        let rows = read_all(&path);
        assert_eq!(rows.len(), 2);
        assert!(is_header(&rows[0]), "header should now be on top");
        assert_eq!(
            rows[1],
            vec!["0:00:01.000", "4.00", "100.00", "job"],
            "the pre-existing row must survive unchanged"
        );
    }

    #[test]
    fn append_only_adds_new_bytes() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("out.csv");
        ensure_header(&path).expect("ensure");
        append(&path, &[record("0:00:01.000", "4.00", "100.00", "job")]).expect("append one");
        let prefix = fs::read(&path).expect("read");
        append(
            &path,
            &[
                record("0:00:02.000", "6.00", "101.00", "job"),
                record("0:00:03.000", "8.00", "102.00", "job"),
            ],
        )
        .expect("append two");
        let full = fs::read(&path).expect("read");
        assert!(
            full.starts_with(&prefix),
            "append must leave earlier bytes in place"
        );
        assert_eq!(read_all(&path).len(), 4);
    }

    #[test]
    fn terminal_block_has_separator_and_source() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("out.csv");
        ensure_header(&path).expect("ensure");
        append_terminal(
            &path,
            &[record("0:00:01.000", "4.00", "100.00", "job")],
            "Python: python train.py",
        )
        .expect("terminal");
        let text = fs::read_to_string(&path).expect("read");
        assert!(
            text.ends_with("\n\n,,,Command/Source: Python: python train.py\n"),
            "unexpected tail: {:?}",
            text
        );
    }

    #[test]
    fn snapshot_replaces_previous_content() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("out.csv");
        fs::write(&path, "stale junk that should vanish\n").expect("seed");
        write_snapshot(
            &path,
            &[record("0:00:01.000", "4.00", "100.00", "job")],
            "job",
        )
        .expect("snapshot");
        let rows = read_all(&path);
        assert!(is_header(&rows[0]));
        assert_eq!(rows[1][0], "0:00:01.000");
        assert_eq!(rows.last().expect("footer")[3], "Command/Source: job");
    }

    #[test]
    fn rows_round_trip_within_tolerance() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("out.csv");
        let written = [
            (1.0_f64, 12.345_f64, 256.789_f64),
            (2.0, 0.0, 1024.5),
            (3661.25, 150.0, 98.765),
        ];
        let records: Vec<[String; 4]> = written
            .iter()
            .map(|(t, c, r)| {
                record(
                    &crate::persist::timefmt::format_elapsed(*t),
                    &format!("{c:.2}"),
                    &format!("{r:.2}"),
                    "job",
                )
            })
            .collect();
        ensure_header(&path).expect("ensure");
        append(&path, &records).expect("append");
        let rows = read_all(&path);
        for ((t, c, r), row) in written.iter().zip(rows.iter().skip(1)) {
            let time = parse_elapsed(&row[0]).expect("time");
            let cpu: f64 = row[1].parse().expect("cpu");
            let ram: f64 = row[2].parse().expect("ram");
            assert!((time - t).abs() < 0.0015, "time {} vs {}", time, t);
            assert!((cpu - c).abs() < 0.005, "cpu {} vs {}", cpu, c);
            assert!((ram - r).abs() < 0.005, "ram {} vs {}", ram, r);
            assert_eq!(row[3], "job");
        }
    }
}
