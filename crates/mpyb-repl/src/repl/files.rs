//! File operations on the device, expressed as correlated REPL snippets.
//!
//! Works identically over any [`CommandRunner`]; both transports get the
//! façade through the blanket impl.

use super::correlator::CommandRunner;
use super::escape::{decode_repr, py_quote};
use mpyb_core::{ReplError, ReplResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Characters of content per write command. Each chunk is escaped
/// separately, so the line on the wire may be longer.
pub const WRITE_CHUNK_CHARS: usize = 512;

const IMPORT_OS: &str = "try:\n    import os\nexcept ImportError:\n    import uos as os\n";

const S_IFDIR: u32 = 0x4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Dir,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: FileKind,
    /// Always 0 for directories.
    pub size: u64,
}

impl FileEntry {
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Dir
    }
}

#[async_trait::async_trait]
pub trait FileSystem: Send + Sync {
    async fn list_files(&self, path: &str) -> ReplResult<Vec<FileEntry>>;
    async fn read_file(&self, path: &str) -> ReplResult<String>;
    async fn write_file(&self, path: &str, content: &str) -> ReplResult<()>;
    async fn mkdir(&self, path: &str) -> ReplResult<()>;
    async fn rm(&self, path: &str) -> ReplResult<()>;
    async fn rmdir(&self, path: &str) -> ReplResult<()>;
}

#[async_trait::async_trait]
impl<T: CommandRunner + ?Sized> FileSystem for T {
    async fn list_files(&self, path: &str) -> ReplResult<Vec<FileEntry>> {
        let out = self.execute_command(&list_snippet(path)).await?;
        parse_listing(&as_text(&out)?)
    }

    async fn read_file(&self, path: &str) -> ReplResult<String> {
        let out = self.execute_command(&read_snippet(path)).await?;
        let text = as_text(&out)?;
        check_remote(&text)?;
        decode_repr(&text)
    }

    async fn write_file(&self, path: &str, content: &str) -> ReplResult<()> {
        for (i, chunk) in content_chunks(content).iter().enumerate() {
            let mode = if i == 0 { "w" } else { "a" };
            let out = self.execute_command(&write_snippet(path, chunk, mode)).await?;
            expect_ok(&out, "write")?;
        }
        Ok(())
    }

    async fn mkdir(&self, path: &str) -> ReplResult<()> {
        let out = self.execute_command(&simple_snippet("mkdir", path)).await?;
        expect_ok(&out, "mkdir")
    }

    async fn rm(&self, path: &str) -> ReplResult<()> {
        let out = self.execute_command(&simple_snippet("remove", path)).await?;
        expect_ok(&out, "rm")
    }

    async fn rmdir(&self, path: &str) -> ReplResult<()> {
        let out = self.execute_command(&simple_snippet("rmdir", path)).await?;
        expect_ok(&out, "rmdir")
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Snippets
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub fn list_snippet(path: &str) -> String {
    format!(
        "{}for e in os.ilistdir({}):\n    print(e[0], hex(e[1]), e[3] if len(e) > 3 else 0)\n",
        IMPORT_OS,
        py_quote(path)
    )
}

pub fn read_snippet(path: &str) -> String {
    format!(
        "{}with open({}, 'r') as f:\n    print(repr(f.read()))\n",
        IMPORT_OS,
        py_quote(path)
    )
}

pub fn write_snippet(path: &str, chunk: &str, mode: &str) -> String {
    format!(
        "{}with open({}, '{}') as f:\n    f.write({})\nprint('OK')\n",
        IMPORT_OS,
        py_quote(path),
        mode,
        py_quote(chunk)
    )
}

fn simple_snippet(func: &str, path: &str) -> String {
    format!("{}os.{}({})\nprint('OK')\n", IMPORT_OS, func, py_quote(path))
}

/// Split on char boundaries. Empty content still yields one (empty) chunk
/// so the file gets truncated.
pub fn content_chunks(content: &str) -> Vec<String> {
    let chars: Vec<char> = content.chars().collect();
    if chars.is_empty() {
        return vec![String::new()];
    }
    chars
        .chunks(WRITE_CHUNK_CHARS)
        .map(|c| c.iter().collect())
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Output decoding
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn as_text(value: &Value) -> ReplResult<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        other => Err(ReplError::protocol(format!(
            "Expected text output, got {}",
            other
        ))),
    }
}

fn check_remote(text: &str) -> ReplResult<()> {
    let t = text.trim();
    if let Some(rest) = t.strip_prefix("ERROR:") {
        return Err(ReplError::remote(rest.trim().to_string()));
    }
    Ok(())
}

fn expect_ok(value: &Value, op: &str) -> ReplResult<()> {
    let text = as_text(value)?;
    check_remote(&text)?;
    if text.trim() == "OK" {
        Ok(())
    } else {
        Err(ReplError::protocol(format!(
            "{}: unexpected output '{}'",
            op,
            text.trim()
        )))
    }
}

/// Parse `<name> <hex type> <size>` lines, keeping wire order. The name
/// may itself contain spaces.
pub fn parse_listing(text: &str) -> ReplResult<Vec<FileEntry>> {
    check_remote(text)?;
    let mut entries = Vec::new();
    for line in text.lines().map(str::trim_end).filter(|l| !l.trim().is_empty()) {
        let mut parts = line.rsplitn(3, ' ');
        let (size, kind, name) = match (parts.next(), parts.next(), parts.next()) {
            (Some(size), Some(kind), Some(name)) => (size, kind, name),
            _ => {
                return Err(ReplError::protocol(format!(
                    "Malformed listing line '{}'",
                    line
                )))
            }
        };
        let type_bits = u32::from_str_radix(kind.trim_start_matches("0x"), 16)
            .map_err(|_| ReplError::protocol(format!("Bad entry type in '{}'", line)))?;
        let size: u64 = size
            .parse()
            .map_err(|_| ReplError::protocol(format!("Bad entry size in '{}'", line)))?;
        let kind = if type_bits & S_IFDIR != 0 {
            FileKind::Dir
        } else {
            FileKind::File
        };
        entries.push(FileEntry {
            name: name.to_string(),
            kind,
            size: if kind == FileKind::Dir { 0 } else { size },
        });
    }
    Ok(entries)
}
