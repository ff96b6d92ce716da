//! Minimal workbook handling for .xlsx session files. Only the first
//! worksheet is touched, and because a zip archive cannot be appended
//! in place, every write rebuilds the whole package through a temp
//! file and an atomic rename.

use std::fs::{self, File};
use std::io::{self, BufReader, Cursor, Read, Write};
use std::path::Path;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use tempfile::NamedTempFile;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use super::{HEADER, PersistError, is_header, parent_dir};

const SHEET_PART: &str = "xl/worksheets/sheet1.xml";
const SHARED_STRINGS_PART: &str = "xl/sharedStrings.xml";

const CONTENT_TYPES: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/><Override PartName="/xl/workbook.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml"/><Override PartName="/xl/worksheets/sheet1.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml"/></Types>"#;

const ROOT_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="xl/workbook.xml"/></Relationships>"#;

const WORKBOOK: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets><sheet name="Sheet1" sheetId="1" r:id="rId1"/></sheets></workbook>"#;

const WORKBOOK_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet1.xml"/></Relationships>"#;

pub(super) fn ensure_header(path: &Path) -> Result<(), PersistError> {
    let header_row: Vec<String> = HEADER.iter().map(|h| h.to_string()).collect();
    let mut rows = existing_rows(path)?;
    match rows.first() {
        Some(first) if is_header(first) => Ok(()),
        _ => {
            rows.insert(0, header_row);
            write_rows(path, &rows)
        }
    }
}

pub(super) fn append(path: &Path, records: &[[String; 4]]) -> Result<(), PersistError> {
    let mut rows = existing_rows(path)?;
    rows.extend(records.iter().map(|r| r.to_vec()));
    write_rows(path, &rows)
}

pub(super) fn append_terminal(
    path: &Path,
    records: &[[String; 4]],
    source: &str,
) -> Result<(), PersistError> {
    let mut rows = existing_rows(path)?;
    rows.extend(records.iter().map(|r| r.to_vec()));
    rows.push(Vec::new());
    rows.push(footer_row(source));
    write_rows(path, &rows)
}

pub(super) fn write_snapshot(
    path: &Path,
    records: &[[String; 4]],
    source: &str,
) -> Result<(), PersistError> {
    let mut rows = vec![HEADER.iter().map(|h| h.to_string()).collect::<Vec<_>>()];
    rows.extend(records.iter().map(|r| r.to_vec()));
    rows.push(Vec::new());
    rows.push(footer_row(source));
    write_rows(path, &rows)
}

fn footer_row(source: &str) -> Vec<String> {
    vec![
        String::new(),
        String::new(),
        String::new(),
        format!("Command/Source: {source}"),
    ]
}

fn existing_rows(path: &Path) -> Result<Vec<Vec<String>>, PersistError> {
    match fs::metadata(path) {
        Ok(meta) if meta.len() > 0 => read_rows(path),
        Ok(_) => Ok(Vec::new()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(err) => Err(PersistError::io(path, err)),
    }
}

/// Reads the first worksheet back as rows of cell text, shared strings
/// resolved. Cell numbers come back in their raw `<v>` spelling.
pub(super) fn read_rows(path: &Path) -> Result<Vec<Vec<String>>, PersistError> {
    let file = File::open(path).map_err(|e| PersistError::io(path, e))?;
    let mut archive = ZipArchive::new(BufReader::new(file))
        .map_err(|e| PersistError::workbook(path, e.to_string()))?;

    let shared = match archive.by_name(SHARED_STRINGS_PART) {
        Ok(mut part) => {
            let mut xml = Vec::new();
            part.read_to_end(&mut xml)
                .map_err(|e| PersistError::io(path, e))?;
            parse_shared_strings(path, &xml)?
        }
        Err(_) => Vec::new(),
    };

    let sheet_name = sheet_part_name(&mut archive)
        .ok_or_else(|| PersistError::workbook(path, "no worksheet part"))?;
    let mut xml = Vec::new();
    archive
        .by_name(&sheet_name)
        .map_err(|e| PersistError::workbook(path, e.to_string()))?
        .read_to_end(&mut xml)
        .map_err(|e| PersistError::io(path, e))?;
    parse_sheet(path, &xml, &shared)
}

fn sheet_part_name(archive: &mut ZipArchive<BufReader<File>>) -> Option<String> {
    if archive.by_name(SHEET_PART).is_ok() {
        return Some(SHEET_PART.to_string());
    }
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("xl/worksheets/") && n.ends_with(".xml"))
        .map(str::to_string)
        .collect();
    names.sort();
    names.into_iter().next()
}

fn parse_shared_strings(path: &Path, xml: &[u8]) -> Result<Vec<String>, PersistError> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut strings = Vec::new();
    let mut current = String::new();
    let mut in_item = false;
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => match e.local_name().as_ref() {
                b"si" => {
                    in_item = true;
                    current.clear();
                }
                b"t" if in_item => in_text = true,
                _ => {}
            },
            Ok(Event::Text(ref e)) if in_text => {
                let text = e
                    .unescape()
                    .map_err(|e| PersistError::workbook(path, e.to_string()))?;
                current.push_str(&text);
            }
            Ok(Event::End(ref e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"si" => {
                    in_item = false;
                    strings.push(std::mem::take(&mut current));
                }
                _ => {}
            },
            Ok(Event::Empty(ref e)) if e.local_name().as_ref() == b"si" => {
                strings.push(String::new());
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(PersistError::workbook(path, e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

fn parse_sheet(
    path: &Path,
    xml: &[u8],
    shared: &[String],
) -> Result<Vec<Vec<String>>, PersistError> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut in_row = false;
    let mut cell_col: Option<usize> = None;
    let mut cell_type: Vec<u8> = Vec::new();
    let mut cell_text = String::new();
    let mut collecting = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => match e.local_name().as_ref() {
                b"row" => {
                    in_row = true;
                    row.clear();
                }
                b"c" if in_row => {
                    cell_col = None;
                    cell_type.clear();
                    cell_text.clear();
                    for attr in e.attributes() {
                        let attr =
                            attr.map_err(|e| PersistError::workbook(path, e.to_string()))?;
                        match attr.key.as_ref() {
                            b"r" => cell_col = column_index(&attr.value),
                            b"t" => cell_type = attr.value.to_vec(),
                            _ => {}
                        }
                    }
                }
                b"v" | b"t" if in_row => collecting = true,
                _ => {}
            },
            Ok(Event::Text(ref e)) if collecting => {
                let text = e
                    .unescape()
                    .map_err(|e| PersistError::workbook(path, e.to_string()))?;
                cell_text.push_str(&text);
            }
            Ok(Event::End(ref e)) => match e.local_name().as_ref() {
                b"v" | b"t" => collecting = false,
                b"c" => {
                    let value = finish_cell(&cell_type, &cell_text, shared);
                    place_cell(&mut row, cell_col.take(), value);
                }
                b"row" => {
                    in_row = false;
                    rows.push(std::mem::take(&mut row));
                }
                _ => {}
            },
            Ok(Event::Empty(ref e)) => match e.local_name().as_ref() {
                b"row" => rows.push(Vec::new()),
                b"c" if in_row => {
                    let mut col = None;
                    for attr in e.attributes() {
                        let attr =
                            attr.map_err(|e| PersistError::workbook(path, e.to_string()))?;
                        if attr.key.as_ref() == b"r" {
                            col = column_index(&attr.value);
                        }
                    }
                    place_cell(&mut row, col, String::new());
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(PersistError::workbook(path, e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(rows)
}

fn finish_cell(cell_type: &[u8], text: &str, shared: &[String]) -> String {
    if cell_type == b"s" {
        text.trim()
            .parse::<usize>()
            .ok()
            .and_then(|idx| shared.get(idx))
            .cloned()
            .unwrap_or_default()
    } else {
        text.to_string()
    }
}

// Cell references are column letters then a row number, e.g. "D12".
fn column_index(cell_ref: &[u8]) -> Option<usize> {
    let mut col: usize = 0;
    let mut seen = false;
    for &b in cell_ref {
        match b {
            b'A'..=b'Z' => {
                col = col * 26 + (b - b'A' + 1) as usize;
                seen = true;
            }
            b'a'..=b'z' => {
                col = col * 26 + (b - b'a' + 1) as usize;
                seen = true;
            }
            _ => break,
        }
    }
    seen.then(|| col - 1)
}

fn column_letters(mut col: usize) -> String {
    let mut letters = String::new();
    loop {
        letters.insert(0, (b'A' + (col % 26) as u8) as char);
        if col < 26 {
            break;
        }
        col = col / 26 - 1;
    }
    letters
}

fn place_cell(row: &mut Vec<String>, col: Option<usize>, value: String) {
    match col {
        Some(idx) => {
            while row.len() < idx {
                row.push(String::new());
            }
            if idx == row.len() {
                row.push(value);
            } else {
                row[idx] = value;
            }
        }
        None => row.push(value),
    }
}

pub(super) fn write_rows(path: &Path, rows: &[Vec<String>]) -> Result<(), PersistError> {
    let mut tmp =
        NamedTempFile::new_in(parent_dir(path)).map_err(|e| PersistError::io(path, e))?;
    {
        let mut zip = ZipWriter::new(tmp.as_file_mut());
        let options =
            SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        write_part(&mut zip, path, "[Content_Types].xml", CONTENT_TYPES, options)?;
        write_part(&mut zip, path, "_rels/.rels", ROOT_RELS, options)?;
        write_part(&mut zip, path, "xl/workbook.xml", WORKBOOK, options)?;
        write_part(&mut zip, path, "xl/_rels/workbook.xml.rels", WORKBOOK_RELS, options)?;
        let sheet = render_sheet(path, rows)?;
        zip.start_file(SHEET_PART, options)
            .map_err(|e| PersistError::workbook(path, e.to_string()))?;
        zip.write_all(&sheet).map_err(|e| PersistError::io(path, e))?;
        zip.finish()
            .map_err(|e| PersistError::workbook(path, e.to_string()))?;
    }
    tmp.persist(path)
        .map_err(|e| PersistError::io(path, e.error))?;
    Ok(())
}

fn write_part(
    zip: &mut ZipWriter<&mut File>,
    path: &Path,
    name: &str,
    data: &str,
    options: SimpleFileOptions,
) -> Result<(), PersistError> {
    zip.start_file(name, options)
        .map_err(|e| PersistError::workbook(path, e.to_string()))?;
    zip.write_all(data.as_bytes())
        .map_err(|e| PersistError::io(path, e))?;
    Ok(())
}

fn render_sheet(path: &Path, rows: &[Vec<String>]) -> Result<Vec<u8>, PersistError> {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), Some("yes"))))
        .map_err(|e| PersistError::workbook(path, e.to_string()))?;
    let mut root = BytesStart::new("worksheet");
    root.push_attribute((
        "xmlns",
        "http://schemas.openxmlformats.org/spreadsheetml/2006/main",
    ));
    writer
        .write_event(Event::Start(root))
        .map_err(|e| PersistError::workbook(path, e.to_string()))?;
    writer
        .write_event(Event::Start(BytesStart::new("sheetData")))
        .map_err(|e| PersistError::workbook(path, e.to_string()))?;
    for (row_idx, cells) in rows.iter().enumerate() {
        render_row(path, &mut writer, row_idx, cells)?;
    }
    writer
        .write_event(Event::End(BytesEnd::new("sheetData")))
        .map_err(|e| PersistError::workbook(path, e.to_string()))?;
    writer
        .write_event(Event::End(BytesEnd::new("worksheet")))
        .map_err(|e| PersistError::workbook(path, e.to_string()))?;
    Ok(writer.into_inner().into_inner())
}

fn render_row(
    path: &Path,
    writer: &mut Writer<Cursor<Vec<u8>>>,
    row_idx: usize,
    cells: &[String],
) -> Result<(), PersistError> {
    let row_ref = (row_idx + 1).to_string();
    let mut row = BytesStart::new("row");
    row.push_attribute(("r", row_ref.as_str()));
    // A separator row carries no cells at all.
    if cells.iter().all(|c| c.is_empty()) {
        return writer
            .write_event(Event::Empty(row))
            .map_err(|e| PersistError::workbook(path, e.to_string()));
    }
    writer
        .write_event(Event::Start(row))
        .map_err(|e| PersistError::workbook(path, e.to_string()))?;
    for (col_idx, value) in cells.iter().enumerate() {
        if value.is_empty() {
            continue;
        }
        let cell_ref = format!("{}{}", column_letters(col_idx), row_idx + 1);
        let mut cell = BytesStart::new("c");
        cell.push_attribute(("r", cell_ref.as_str()));
        let numeric = value.parse::<f64>().is_ok_and(|n| n.is_finite());
        if numeric {
            writer
                .write_event(Event::Start(cell))
                .map_err(|e| PersistError::workbook(path, e.to_string()))?;
            write_text_element(path, writer, "v", value)?;
        } else {
            cell.push_attribute(("t", "inlineStr"));
            writer
                .write_event(Event::Start(cell))
                .map_err(|e| PersistError::workbook(path, e.to_string()))?;
            writer
                .write_event(Event::Start(BytesStart::new("is")))
                .map_err(|e| PersistError::workbook(path, e.to_string()))?;
            write_text_element(path, writer, "t", value)?;
            writer
                .write_event(Event::End(BytesEnd::new("is")))
                .map_err(|e| PersistError::workbook(path, e.to_string()))?;
        }
        writer
            .write_event(Event::End(BytesEnd::new("c")))
            .map_err(|e| PersistError::workbook(path, e.to_string()))?;
    }
    writer
        .write_event(Event::End(BytesEnd::new("row")))
        .map_err(|e| PersistError::workbook(path, e.to_string()))
}

fn write_text_element(
    path: &Path,
    writer: &mut Writer<Cursor<Vec<u8>>>,
    tag: &str,
    text: &str,
) -> Result<(), PersistError> {
    writer
        .write_event(Event::Start(BytesStart::new(tag)))
        .map_err(|e| PersistError::workbook(path, e.to_string()))?;
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .map_err(|e| PersistError::workbook(path, e.to_string()))?;
    writer
        .write_event(Event::End(BytesEnd::new(tag)))
        .map_err(|e| PersistError::workbook(path, e.to_string()))
}
