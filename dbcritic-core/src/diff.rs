//! Unified diff parsing and chunking.
//!
//! Diffs are split into prompt-sized chunks along file and hunk boundaries
//! so every chunk handed to the model is syntactically coherent: it always
//! starts with a file header and contains whole hunks. A single hunk larger
//! than the budget becomes a chunk of its own rather than being split
//! mid-hunk.

/// One file's portion of a unified diff.
#[derive(Debug, Clone, PartialEq)]
pub struct FileDiff {
    /// Path on the new side of the diff.
    pub path: String,
    /// The `diff --git`, index and `---`/`+++` lines, verbatim.
    pub header: String,
    pub hunks: Vec<Hunk>,
}

/// One `@@` hunk.
#[derive(Debug, Clone, PartialEq)]
pub struct Hunk {
    /// The `@@ -a,b +c,d @@` line, without trailing newline.
    pub header: String,
    /// Everything between this hunk header and the next boundary.
    pub body: String,
}

/// A prompt-sized slice of a diff, covering whole hunks only.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffChunk {
    /// Zero-based position of this chunk within the diff.
    pub index: usize,
    /// Paths whose hunks appear in this chunk. Empty for the raw fallback.
    pub files: Vec<String>,
    pub text: String,
    pub tokens: usize,
}

/// Approximate token count used for prompt budgeting and usage metrics.
/// Whitespace-separated words undercount BPE tokens slightly, which errs on
/// the side of smaller chunks.
pub fn estimate_tokens(text: &str) -> usize {
    text.split_whitespace().count()
}

fn path_from_git_header(line: &str) -> Option<String> {
    let rest = line.strip_prefix("diff --git ")?;
    let new_side = rest.split_whitespace().last()?;
    Some(new_side.strip_prefix("b/").unwrap_or(new_side).to_string())
}

/// Parse a unified diff into per-file sections. Lines before the first
/// `diff --git` marker are ignored; input without any marker yields an
/// empty vec.
pub fn parse_diff(raw: &str) -> Vec<FileDiff> {
    let mut files: Vec<FileDiff> = Vec::new();
    let mut current: Option<FileDiff> = None;
    let mut current_hunk: Option<Hunk> = None;

    let close_hunk = |file: &mut Option<FileDiff>, hunk: &mut Option<Hunk>| {
        if let (Some(f), Some(h)) = (file.as_mut(), hunk.take()) {
            f.hunks.push(h);
        }
    };

    for line in raw.lines() {
        if line.starts_with("diff --git ") {
            close_hunk(&mut current, &mut current_hunk);
            if let Some(f) = current.take() {
                files.push(f);
            }
            current = Some(FileDiff {
                path: path_from_git_header(line).unwrap_or_default(),
                header: format!("{}\n", line),
                hunks: Vec::new(),
            });
        } else if line.starts_with("@@") && current.is_some() {
            close_hunk(&mut current, &mut current_hunk);
            current_hunk = Some(Hunk {
                header: line.to_string(),
                body: String::new(),
            });
        } else if let Some(h) = current_hunk.as_mut() {
            h.body.push_str(line);
            h.body.push('\n');
        } else if let Some(f) = current.as_mut() {
            f.header.push_str(line);
            f.header.push('\n');
        }
    }
    close_hunk(&mut current, &mut current_hunk);
    if let Some(f) = current.take() {
        files.push(f);
    }
    files
}

/// Split a raw diff into chunks of at most `max_tokens` estimated tokens.
///
/// Chunks break only between hunks; a file whose hunks span chunks gets its
/// header repeated so each chunk parses on its own. Files without hunks
/// (binary changes, pure renames) are dropped. Input that does not look like
/// a unified diff at all is passed through as a single raw chunk so an
/// unusual but non-empty diff still gets reviewed.
pub fn chunk_diff(raw: &str, max_tokens: usize) -> Vec<DiffChunk> {
    let files = parse_diff(raw);
    if files.is_empty() {
        if raw.trim().is_empty() {
            return Vec::new();
        }
        return vec![DiffChunk {
            index: 0,
            files: Vec::new(),
            text: raw.to_string(),
            tokens: estimate_tokens(raw),
        }];
    }

    fn flush(chunks: &mut Vec<DiffChunk>, text: &mut String, files: &mut Vec<String>, tokens: &mut usize) {
        if text.is_empty() {
            return;
        }
        chunks.push(DiffChunk {
            index: chunks.len(),
            files: std::mem::take(files),
            text: std::mem::take(text),
            tokens: *tokens,
        });
        *tokens = 0;
    }

    let mut chunks: Vec<DiffChunk> = Vec::new();
    let mut text = String::new();
    let mut chunk_files: Vec<String> = Vec::new();
    let mut tokens = 0usize;

    for file in &files {
        let header_tokens = estimate_tokens(&file.header);
        let mut header_written = false;
        for hunk in &file.hunks {
            let hunk_tokens = estimate_tokens(&hunk.header) + estimate_tokens(&hunk.body);
            let added = if header_written {
                hunk_tokens
            } else {
                header_tokens + hunk_tokens
            };
            if tokens + added > max_tokens && !text.is_empty() {
                flush(&mut chunks, &mut text, &mut chunk_files, &mut tokens);
                header_written = false;
            }
            if !header_written {
                text.push_str(&file.header);
                chunk_files.push(file.path.clone());
                tokens += header_tokens;
                header_written = true;
            }
            text.push_str(&hunk.header);
            text.push('\n');
            text.push_str(&hunk.body);
            tokens += hunk_tokens;
        }
    }
    flush(&mut chunks, &mut text, &mut chunk_files, &mut tokens);
    chunks
}
