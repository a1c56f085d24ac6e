//! Reader for Anki package exports (`.apkg`).
//!
//! A package is a ZIP archive holding the exported collection as a SQLite
//! database (`collection.anki21`, or `collection.anki2` from older clients)
//! and a `media` index. Notes are read straight from the collection and
//! rendered through their note type's first card template.

use std::collections::HashMap;
use std::io::{Cursor, Read, Write};

use diesel::prelude::*;
use diesel::sql_types::{BigInt, Integer, Text};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

/// Largest upload accepted for a package
pub const MAX_PACKAGE_BYTES: usize = 100 * 1024 * 1024;
/// Deck name used when the package only holds the default deck
pub const FALLBACK_DECK_NAME: &str = "Imported Deck";

const MAX_COLLECTION_BYTES: u64 = 512 * 1024 * 1024;
const MAX_MEDIA_INDEX_BYTES: u64 = 16 * 1024 * 1024;
const FIELD_SEPARATOR: char = '\x1f';
const CLOZE_MODEL: i64 = 1;
const DEFAULT_DECK: &str = "Default";

#[derive(Debug, Error)]
pub enum ApkgError {
    #[error("not a valid package archive: {0}")]
    Archive(String),
    #[error("package holds no collection")]
    MissingCollection,
    #[error("package uses the {0} format, export it with \"Support older Anki versions\" enabled")]
    UnsupportedFormat(&'static str),
    #[error("{0} exceeds the size limit")]
    TooLarge(String),
    #[error("cannot read collection: {0}")]
    Collection(String),
    #[error("invalid collection metadata: {0}")]
    Metadata(String),
}

/// A note read from a package, rendered to a front and a back
#[derive(Debug, Clone, PartialEq)]
pub struct PackageNote {
    pub note_id: i64,
    pub note_type: String,
    pub cloze: bool,
    pub front: String,
    pub back: String,
    pub tags: Vec<String>,
}

/// Contents of a parsed package
#[derive(Debug, Clone, Default)]
pub struct Package {
    pub deck_name: String,
    pub notes: Vec<PackageNote>,
    /// Names of the note types the collection defines
    pub note_types: Vec<String>,
    /// Notes dropped because their note type is missing
    pub skipped_notes: usize,
    pub media_files: usize,
}

#[derive(Debug, Deserialize)]
struct NoteModel {
    name: String,
    #[serde(rename = "type", default)]
    kind: i64,
    #[serde(default)]
    flds: Vec<ModelField>,
    #[serde(default)]
    tmpls: Vec<ModelTemplate>,
}

#[derive(Debug, Deserialize)]
struct ModelField {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ModelTemplate {
    #[serde(default)]
    qfmt: String,
    #[serde(default)]
    afmt: String,
}

#[derive(Debug, Deserialize)]
struct DeckEntry {
    name: String,
}

#[derive(QueryableByName)]
struct CollectionRow {
    #[diesel(sql_type = Text)]
    models: String,
    #[diesel(sql_type = Text)]
    decks: String,
}

#[derive(QueryableByName)]
struct NoteRow {
    #[diesel(sql_type = BigInt)]
    note_id: i64,
    #[diesel(sql_type = BigInt)]
    model_id: i64,
    #[diesel(sql_type = Text)]
    tags: String,
    #[diesel(sql_type = Text)]
    fields: String,
    #[diesel(sql_type = BigInt)]
    deck_id: i64,
    #[diesel(sql_type = Integer)]
    ord: i32,
}

const NOTES_QUERY: &str = "SELECT n.id AS note_id, n.mid AS model_id, n.tags AS tags, n.flds AS fields, \
     c.did AS deck_id, c.ord AS ord \
     FROM notes n JOIN cards c ON c.nid = n.id \
     ORDER BY n.id, c.ord";

fn read_entry_bounded(
    archive: &mut zip::ZipArchive<Cursor<&[u8]>>,
    name: &str,
    max_bytes: u64,
) -> Result<Vec<u8>, ApkgError> {
    let entry = archive.by_name(name).map_err(|e| ApkgError::Archive(e.to_string()))?;
    let mut out = Vec::new();
    entry
        .take(max_bytes)
        .read_to_end(&mut out)
        .map_err(|e| ApkgError::Archive(e.to_string()))?;
    if out.len() as u64 >= max_bytes {
        return Err(ApkgError::TooLarge(name.to_string()));
    }
    Ok(out)
}

/// Parses an `.apkg` archive held in memory
///
/// The collection is written to a temporary file so SQLite can open it.
///
/// ### Arguments
///
/// * `bytes` - The raw archive
///
/// ### Returns
///
/// One entry per note, in note id order, plus the deck name and note types
///
/// ### Errors
///
/// Returns an `ApkgError` if the archive is not a ZIP, holds no readable
/// collection, or the collection metadata is malformed
pub fn parse_apkg(bytes: &[u8]) -> Result<Package, ApkgError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| ApkgError::Archive(e.to_string()))?;
    let names: Vec<String> = archive.file_names().map(str::to_string).collect();
    let has = |name: &str| names.iter().any(|n| n == name);

    let collection_name = if has("collection.anki21") {
        "collection.anki21"
    } else if has("collection.anki21b") {
        return Err(ApkgError::UnsupportedFormat("collection.anki21b"));
    } else if has("collection.anki2") {
        "collection.anki2"
    } else {
        return Err(ApkgError::MissingCollection);
    };
    let collection = read_entry_bounded(&mut archive, collection_name, MAX_COLLECTION_BYTES)?;
    debug!("Read {} ({} bytes)", collection_name, collection.len());

    let media_files = if has("media") {
        let index = read_entry_bounded(&mut archive, "media", MAX_MEDIA_INDEX_BYTES)?;
        match serde_json::from_slice::<HashMap<String, String>>(&index) {
            Ok(media) => media.len(),
            Err(err) => {
                warn!("Ignoring unreadable media index: {}", err);
                0
            }
        }
    } else {
        0
    };

    let mut file = tempfile::NamedTempFile::new().map_err(|e| ApkgError::Collection(e.to_string()))?;
    file.write_all(&collection).map_err(|e| ApkgError::Collection(e.to_string()))?;
    file.flush().map_err(|e| ApkgError::Collection(e.to_string()))?;
    let path = file
        .path()
        .to_str()
        .ok_or_else(|| ApkgError::Collection("temporary path is not valid UTF-8".to_string()))?;

    let mut conn = SqliteConnection::establish(path).map_err(|e| ApkgError::Collection(e.to_string()))?;
    let mut package = read_collection(&mut conn)?;
    package.media_files = media_files;
    Ok(package)
}

fn read_collection(conn: &mut SqliteConnection) -> Result<Package, ApkgError> {
    let row = diesel::sql_query("SELECT models, decks FROM col LIMIT 1")
        .get_result::<CollectionRow>(conn)
        .optional()
        .map_err(|e| ApkgError::Collection(e.to_string()))?
        .ok_or_else(|| ApkgError::Collection("empty collection".to_string()))?;

    let models: HashMap<String, NoteModel> =
        serde_json::from_str(&row.models).map_err(|e| ApkgError::Metadata(format!("note types: {e}")))?;
    let decks: HashMap<String, DeckEntry> =
        serde_json::from_str(&row.decks).map_err(|e| ApkgError::Metadata(format!("decks: {e}")))?;

    let rows = diesel::sql_query(NOTES_QUERY)
        .load::<NoteRow>(conn)
        .map_err(|e| ApkgError::Collection(e.to_string()))?;

    let mut notes = Vec::new();
    let mut skipped_notes = 0;
    let mut deck_counts: HashMap<i64, usize> = HashMap::new();
    let mut last_note = None;

    for row in rows {
        // Only the lowest-ordinal card of a note is kept
        if last_note == Some(row.note_id) {
            continue;
        }
        last_note = Some(row.note_id);

        let Some(model) = models.get(&row.model_id.to_string()) else {
            warn!("Note {} uses unknown note type {}", row.note_id, row.model_id);
            skipped_notes += 1;
            continue;
        };
        *deck_counts.entry(row.deck_id).or_default() += 1;
        notes.push(render_note(&row, model));
    }

    let mut note_types: Vec<String> = models.values().map(|m| m.name.clone()).collect();
    note_types.sort();

    Ok(Package {
        deck_name: pick_deck_name(&decks, &deck_counts),
        notes,
        note_types,
        skipped_notes,
        media_files: 0,
    })
}

/// The non-default deck holding the most notes, ties broken by name
fn pick_deck_name(decks: &HashMap<String, DeckEntry>, counts: &HashMap<i64, usize>) -> String {
    counts
        .iter()
        .filter_map(|(id, count)| decks.get(&id.to_string()).map(|deck| (deck.name.as_str(), *count)))
        .filter(|(name, _)| *name != DEFAULT_DECK)
        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(a.0)))
        .map(|(name, _)| name.to_string())
        .unwrap_or_else(|| FALLBACK_DECK_NAME.to_string())
}

fn render_note(row: &NoteRow, model: &NoteModel) -> PackageNote {
    let values: Vec<&str> = row.fields.split(FIELD_SEPARATOR).collect();
    let fields: HashMap<&str, &str> = model
        .flds
        .iter()
        .enumerate()
        .map(|(i, field)| (field.name.as_str(), values.get(i).copied().unwrap_or_default()))
        .collect();
    let tags = row.tags.split_whitespace().map(str::to_string).collect();
    let cloze = model.kind == CLOZE_MODEL;

    let (front, back) = if cloze {
        (
            values.first().copied().unwrap_or_default().to_string(),
            values.get(1).copied().unwrap_or_default().to_string(),
        )
    } else {
        let template = usize::try_from(row.ord)
            .ok()
            .and_then(|ord| model.tmpls.get(ord))
            .or_else(|| model.tmpls.first());
        match template {
            Some(template) => {
                let front = render_template(&template.qfmt, &fields, "");
                let back = render_template(&template.afmt, &fields, "");
                (front, strip_answer_rule(&back))
            }
            None => (
                values.first().copied().unwrap_or_default().to_string(),
                values.get(1).copied().unwrap_or_default().to_string(),
            ),
        }
    };

    PackageNote {
        note_id: row.note_id,
        note_type: model.name.clone(),
        cloze,
        front: front.trim().to_string(),
        back: back.trim().to_string(),
        tags,
    }
}

/// Drops the `<hr id=answer>` rule the answer template opens with
fn strip_answer_rule(back: &str) -> String {
    let trimmed = back.trim_start();
    for rule in ["<hr id=answer>", "<hr id=\"answer\">"] {
        if let Some(rest) = trimmed.strip_prefix(rule) {
            return rest.to_string();
        }
    }
    trimmed.to_string()
}

/// Renders a card template against the note's fields
///
/// Supports `{{Field}}`, filters such as `{{hint:Field}}` (`type:` renders
/// nothing), `{{FrontSide}}`, and `{{#Field}}`/`{{^Field}}` sections.
/// Unknown fields render empty.
pub fn render_template(template: &str, fields: &HashMap<&str, &str>, front_side: &str) -> String {
    let expanded = expand_sections(template, fields);
    let mut out = String::with_capacity(expanded.len());
    let mut rest = expanded.as_str();

    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start + 2..].find("}}") else {
            break;
        };
        out.push_str(&rest[..start]);
        let tag = rest[start + 2..start + 2 + len].trim();
        out.push_str(&substitute(tag, fields, front_side));
        rest = &rest[start + 2 + len + 2..];
    }
    out.push_str(rest);
    out
}

fn substitute(tag: &str, fields: &HashMap<&str, &str>, front_side: &str) -> String {
    if tag == "FrontSide" {
        return front_side.to_string();
    }
    // Leftovers of unclosed sections
    if tag.starts_with(['#', '^', '/']) {
        return format!("{{{{{tag}}}}}");
    }
    let (filters, name) = match tag.rsplit_once(':') {
        Some((filters, name)) => (Some(filters), name.trim()),
        None => (None, tag),
    };
    if filters.is_some_and(|f| f.split(':').any(|filter| filter.trim() == "type")) {
        return String::new();
    }
    fields.get(name).copied().unwrap_or_default().to_string()
}

fn expand_sections(template: &str, fields: &HashMap<&str, &str>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start + 2..].find("}}") else {
            break;
        };
        let body_start = start + 2 + len + 2;
        let tag = rest[start + 2..start + 2 + len].trim();
        let (inverted, name) = if let Some(name) = tag.strip_prefix('#') {
            (false, name.trim())
        } else if let Some(name) = tag.strip_prefix('^') {
            (true, name.trim())
        } else {
            out.push_str(&rest[..body_start]);
            rest = &rest[body_start..];
            continue;
        };

        let close = format!("{{{{/{name}}}}}");
        let Some(body_len) = rest[body_start..].find(&close) else {
            // Unclosed section, keep the text as is
            out.push_str(&rest[..body_start]);
            rest = &rest[body_start..];
            continue;
        };

        out.push_str(&rest[..start]);
        let filled = fields.get(name).is_some_and(|value| !value.trim().is_empty());
        if filled != inverted {
            out.push_str(&expand_sections(&rest[body_start..body_start + body_len], fields));
        }
        rest = &rest[body_start + body_len + close.len()..];
    }
    out.push_str(rest);
    out
}
