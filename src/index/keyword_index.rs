/// Tantivy keyword index over chunk text and document titles
///
/// Lives in RAM and is rebuilt from chunk text whenever a snapshot is
/// loaded. Every chunk is one tantivy document carrying its document's
/// title, so a title hit surfaces the chunks of that document.
use crate::analysis;
use tantivy::collector::TopDocs;
use tantivy::query::QueryParser;
use tantivy::schema::*;
use tantivy::{doc, Index, IndexReader, IndexWriter, ReloadPolicy, TantivyError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KeywordIndexError {
    #[error("Failed to open keyword index: {0}")]
    Open(String),

    #[error("Failed to write postings: {0}")]
    Write(String),

    #[error("Keyword query failed: {0}")]
    Query(String),

    #[error(transparent)]
    Tantivy(#[from] TantivyError),
}

/// A chunk matched by BM25
#[derive(Debug, Clone, Copy)]
pub struct Bm25Hit {
    pub chunk_id: u64,
    pub bm25: f32,
}

const TITLE_BOOST: f32 = 2.0;

pub struct KeywordIndex {
    index: Index,
    reader: IndexReader,
    writer: IndexWriter,
    id_field: Field,
    path_field: Field,
    title_field: Field,
    body_field: Field,
}

impl KeywordIndex {
    /// Create an empty in-memory index
    ///
    /// `writer_memory` is the tantivy heap budget in bytes (at least 15MB).
    pub fn new(writer_memory: usize) -> Result<Self, KeywordIndexError> {
        let mut schema_builder = Schema::builder();

        let stemmed = TextOptions::default().set_indexing_options(
            TextFieldIndexing::default()
                .set_tokenizer(analysis::ANALYZER_NAME)
                .set_index_option(IndexRecordOption::WithFreqsAndPositions),
        );

        let id_field = schema_builder.add_u64_field("chunk_id", INDEXED | STORED);
        let path_field = schema_builder.add_text_field("path", STRING);
        let title_field = schema_builder.add_text_field("title", stemmed.clone());
        let body_field = schema_builder.add_text_field("body", stemmed);
        let schema = schema_builder.build();

        let index = Index::create_in_ram(schema);
        index
            .tokenizers()
            .register(analysis::ANALYZER_NAME, analysis::analyzer());

        let writer = index
            .writer_with_num_threads(1, writer_memory)
            .map_err(|e| KeywordIndexError::Open(e.to_string()))?;

        // Reloaded explicitly after each commit so a search issued right
        // after a mutation sees it
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()
            .map_err(|e| KeywordIndexError::Open(e.to_string()))?;

        Ok(Self {
            index,
            reader,
            writer,
            id_field,
            path_field,
            title_field,
            body_field,
        })
    }

    /// Stage a chunk for indexing; visible after [`commit`](Self::commit)
    pub fn insert(
        &mut self,
        id: u64,
        path: &str,
        title: &str,
        body: &str,
    ) -> Result<(), KeywordIndexError> {
        let doc = doc!(
            self.id_field => id,
            self.path_field => path,
            self.title_field => title,
            self.body_field => body,
        );

        self.writer
            .add_document(doc)
            .map_err(|e| KeywordIndexError::Write(e.to_string()))?;
        Ok(())
    }

    /// Stage removal of every chunk of a document
    pub fn delete_path(&mut self, path: &str) {
        self.writer
            .delete_term(Term::from_field_text(self.path_field, path));
    }

    /// Stage removal of a single chunk
    pub fn delete_chunk(&mut self, id: u64) {
        self.writer.delete_term(Term::from_field_u64(self.id_field, id));
    }

    /// Commit staged changes and reload the reader
    pub fn commit(&mut self) -> Result<(), KeywordIndexError> {
        self.writer
            .commit()
            .map_err(|e| KeywordIndexError::Write(e.to_string()))?;

        self.reader
            .reload()
            .map_err(|e| KeywordIndexError::Query(e.to_string()))?;
        Ok(())
    }

    /// BM25 search over titles and bodies. Query syntax errors are
    /// tolerated; whatever parses is searched.
    pub fn search(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Bm25Hit>, KeywordIndexError> {
        if query.trim().is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let searcher = self.reader.searcher();

        let mut query_parser =
            QueryParser::for_index(&self.index, vec![self.title_field, self.body_field]);
        query_parser.set_field_boost(self.title_field, TITLE_BOOST);
        let (query, errors) = query_parser.parse_query_lenient(query);
        if !errors.is_empty() {
            tracing::debug!("Lenient query parse dropped {} fragment(s)", errors.len());
        }

        let ranked = searcher
            .search(&query, &TopDocs::with_limit(limit))
            .map_err(|e| KeywordIndexError::Query(e.to_string()))?;

        ranked
            .into_iter()
            .map(|(bm25, address)| {
                let stored: tantivy::TantivyDocument = searcher
                    .doc(address)
                    .map_err(|e| KeywordIndexError::Query(e.to_string()))?;
                let chunk_id = stored
                    .get_first(self.id_field)
                    .and_then(|v| v.as_u64())
                    .ok_or_else(|| KeywordIndexError::Query("posting without chunk id".to_string()))?;
                Ok(Bm25Hit { chunk_id, bm25 })
            })
            .collect()
    }

    /// Drop every document
    pub fn clear(&mut self) -> Result<(), KeywordIndexError> {
        self.writer
            .delete_all_documents()
            .map_err(|e| KeywordIndexError::Write(e.to_string()))?;
        self.commit()
    }

    /// Number of committed chunks
    pub fn len(&self) -> u64 {
        self.reader.searcher().num_docs()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
