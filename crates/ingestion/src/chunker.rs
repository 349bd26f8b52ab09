//! Document chunking
//!
//! Splits a document along its labeled section boundaries and further
//! splits any section whose rendered text exceeds the configured maximum.
//! Table sections only ever split between rows. Sequence numbers increase
//! across the whole document so the stitcher can reconstruct reading order.

use finlens_common::config::ChunkingConfig;
use finlens_common::errors::{PipelineError, Result};
use finlens_common::model::{Chunk, Document, Section, SectionBody};
use text_splitter::{ChunkConfig, TextSplitter};
use tracing::debug;
use uuid::Uuid;

pub struct Chunker {
    config: ChunkingConfig,
}

impl Chunker {
    pub fn new(config: ChunkingConfig) -> Self {
        Self { config }
    }

    /// Split a document into its ordered chunk sequence.
    ///
    /// Concatenating the produced chunk contents per section (in sequence
    /// order) reconstructs that section's rendered text losslessly, and no
    /// chunk exceeds `max_chunk_size`. Fails with `MalformedDocument` when
    /// the document has no usable section boundary, or when a table row is
    /// longer than the chunk bound (rows are never cut).
    pub fn chunk(&self, document: &Document) -> Result<Vec<Chunk>> {
        if document.sections.is_empty() || document.sections.iter().all(Section::is_empty) {
            return Err(PipelineError::MalformedDocument {
                document_id: document.id,
                message: "document has no recognizable section boundary".to_string(),
            });
        }

        let mut chunks = Vec::new();
        let mut sequence: u32 = 0;

        for section in &document.sections {
            if section.is_empty() {
                continue;
            }

            let text = section.content_text();
            let pieces = self.split_section(document.id, section, &text)?;

            for content in pieces {
                chunks.push(Chunk {
                    id: Uuid::new_v4(),
                    document_id: document.id,
                    content,
                    section_label: section.label.clone(),
                    period: document.period.clone(),
                    sequence,
                });
                sequence += 1;
            }
        }

        debug!(
            document_id = %document.id,
            section_count = document.sections.len(),
            chunk_count = chunks.len(),
            max_chunk_size = self.config.max_chunk_size,
            "Document chunked"
        );

        Ok(chunks)
    }

    /// Split one section's rendered text into pieces no longer than the
    /// configured maximum, preserving the section's internal structure.
    fn split_section(
        &self,
        document_id: Uuid,
        section: &Section,
        text: &str,
    ) -> Result<Vec<String>> {
        if text.len() <= self.config.max_chunk_size {
            return Ok(vec![text.to_string()]);
        }

        match &section.body {
            SectionBody::Table { .. } => self.split_table_text(document_id, section, text),
            SectionBody::Narrative(_) => Ok(self.split_narrative_text(text)),
        }
    }

    /// Table text splits only between row lines. Each rendered row ends
    /// with a newline, so grouping whole lines keeps every row intact.
    fn split_table_text(
        &self,
        document_id: Uuid,
        section: &Section,
        text: &str,
    ) -> Result<Vec<String>> {
        let mut pieces = Vec::new();
        let mut current = String::new();

        for line in split_lines_inclusive(text) {
            if line.len() > self.config.max_chunk_size {
                return Err(PipelineError::MalformedDocument {
                    document_id,
                    message: format!(
                        "row in section '{}' exceeds the chunk bound ({} > {})",
                        section.label,
                        line.len(),
                        self.config.max_chunk_size
                    ),
                });
            }

            if current.len() + line.len() > self.config.max_chunk_size && !current.is_empty() {
                pieces.push(std::mem::take(&mut current));
            }
            current.push_str(line);
        }

        if !current.is_empty() {
            pieces.push(current);
        }

        Ok(pieces)
    }

    /// Narrative text splits at semantic boundaries. Trimming is disabled
    /// so the pieces partition the input exactly.
    fn split_narrative_text(&self, text: &str) -> Vec<String> {
        let splitter = TextSplitter::new(
            ChunkConfig::new(self.config.max_chunk_size).with_trim(false),
        );

        splitter.chunks(text).map(|s| s.to_string()).collect()
    }
}

/// Split text into lines keeping each line's trailing newline, so the
/// pieces concatenate back to the input byte-for-byte.
fn split_lines_inclusive(text: &str) -> Vec<&str> {
    let mut lines = Vec::new();
    let mut start = 0;

    for (i, b) in text.bytes().enumerate() {
        if b == b'\n' {
            lines.push(&text[start..=i]);
            start = i + 1;
        }
    }
    if start < text.len() {
        lines.push(&text[start..]);
    }

    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use finlens_common::model::{Period, SourceRef};

    fn period() -> Period {
        Period {
            fiscal_period: "Q2 FY2025".to_string(),
            currency: "USD".to_string(),
        }
    }

    fn document(sections: Vec<Section>) -> Document {
        Document {
            id: Uuid::new_v4(),
            sections,
            period: period(),
            source: SourceRef {
                filename: "q2_report.pdf".to_string(),
                page: Some(1),
                row: None,
            },
        }
    }

    fn table_section(label: &str, rows: usize, cell: &str) -> Section {
        Section {
            label: label.to_string(),
            body: SectionBody::Table {
                header: vec!["Line".to_string(), "Amount".to_string()],
                rows: (0..rows)
                    .map(|i| vec![format!("{} {}", cell, i), format!("{}", i * 1000)])
                    .collect(),
            },
        }
    }

    #[test]
    fn test_chunking_is_lossless_per_section() {
        let sections = vec![
            table_section("Income Statement", 200, "Revenue line"),
            Section {
                label: "MD&A".to_string(),
                body: SectionBody::Narrative("Management discussion. ".repeat(300)),
            },
        ];
        let doc = document(sections);

        let chunker = Chunker::new(ChunkingConfig { max_chunk_size: 500 });
        let chunks = chunker.chunk(&doc).unwrap();

        for section in &doc.sections {
            let rebuilt: String = chunks
                .iter()
                .filter(|c| c.section_label == section.label)
                .map(|c| c.content.as_str())
                .collect();
            assert_eq!(rebuilt, section.content_text());
        }
    }

    #[test]
    fn test_no_chunk_exceeds_size_bound() {
        let doc = document(vec![table_section("Balance Sheet", 300, "Assets")]);
        let chunker = Chunker::new(ChunkingConfig { max_chunk_size: 400 });

        let chunks = chunker.chunk(&doc).unwrap();

        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.content.len() <= 400);
        }
    }

    #[test]
    fn test_table_chunks_never_cut_a_row() {
        let doc = document(vec![table_section("Balance Sheet", 100, "Liabilities")]);
        let chunker = Chunker::new(ChunkingConfig { max_chunk_size: 300 });

        let chunks = chunker.chunk(&doc).unwrap();

        for chunk in &chunks {
            // Whole rows only: every chunk ends exactly at a line boundary.
            assert!(chunk.content.ends_with('\n'));
        }
    }

    #[test]
    fn test_sequence_numbers_are_monotonic() {
        let doc = document(vec![
            table_section("A", 50, "x"),
            table_section("B", 50, "y"),
        ]);
        let chunker = Chunker::new(ChunkingConfig { max_chunk_size: 256 });

        let chunks = chunker.chunk(&doc).unwrap();

        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.sequence, i as u32);
        }
    }

    #[test]
    fn test_document_without_sections_is_malformed() {
        let doc = document(vec![]);
        let chunker = Chunker::new(ChunkingConfig::default());

        let err = chunker.chunk(&doc).unwrap_err();
        assert!(matches!(err, PipelineError::MalformedDocument { .. }));
    }

    #[test]
    fn test_oversized_row_is_malformed() {
        let doc = document(vec![Section {
            label: "Wide".to_string(),
            body: SectionBody::Table {
                header: vec![],
                rows: vec![vec!["x".repeat(1000)]],
            },
        }]);
        let chunker = Chunker::new(ChunkingConfig { max_chunk_size: 100 });

        let err = chunker.chunk(&doc).unwrap_err();
        assert!(matches!(err, PipelineError::MalformedDocument { .. }));
    }

    #[test]
    fn test_chunk_inherits_period_metadata() {
        let doc = document(vec![table_section("Income Statement", 2, "Revenue")]);
        let chunker = Chunker::new(ChunkingConfig::default());

        let chunks = chunker.chunk(&doc).unwrap();

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].period.fiscal_period, "Q2 FY2025");
        assert_eq!(chunks[0].document_id, doc.id);
    }
}
