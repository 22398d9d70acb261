use std::cmp::Ordering;

use tantivy::collector::TopDocs;
use tantivy::query::{Query, QueryParser, QueryParserError};
use tantivy::{Searcher, TantivyDocument};

use super::{stored_title, Fields, IndexEngine};
use crate::error::{Error, Result};

/// A matching note and its relevance score
#[derive(Debug, Clone, PartialEq)]
pub struct RankedTitle {
    pub title: String,
    pub score: f32,
}

/// Answers keyword queries against an [`IndexEngine`]
pub struct QueryPlanner<'a> {
    engine: &'a IndexEngine,
}

impl<'a> QueryPlanner<'a> {
    pub fn new(engine: &'a IndexEngine) -> Self {
        Self { engine }
    }

    /// Titles of all notes matching `keywords`, most relevant first
    pub fn query(&self, keywords: &str) -> Result<Vec<String>> {
        Ok(self
            .query_ranked(keywords)?
            .into_iter()
            .map(|hit| hit.title)
            .collect())
    }

    /// Like [`QueryPlanner::query`] but keeps the scores.
    ///
    /// Higher score first, equal scores by title, so a given index state and
    /// query always yield the same order.
    pub fn query_ranked(&self, keywords: &str) -> Result<Vec<RankedTitle>> {
        if keywords.trim().is_empty() {
            return Err(Error::InvalidQuery("empty query".into()));
        }

        self.engine.read(|searcher, fields| {
            let query = parse_keywords(searcher, fields, keywords)?;
            log::debug!("[QueryPlanner] {:?} parsed as {:?}", keywords, query);

            let mut hits = collect_all(searcher, query.as_ref(), fields)?;
            hits.sort_by(|a, b| match b.score.total_cmp(&a.score) {
                Ordering::Equal => a.title.cmp(&b.title),
                other => other,
            });
            log::debug!("[QueryPlanner] {:?} matched {} notes", keywords, hits.len());
            Ok(hits)
        })
    }
}

/// Every word is required and matches in the title or the body.
/// `"..."` is a phrase, `-` excludes a word or phrase.
fn parse_keywords(searcher: &Searcher, fields: Fields, keywords: &str) -> Result<Box<dyn Query>> {
    let mut query_parser = QueryParser::for_index(searcher.index(), vec![fields.title, fields.body]);
    query_parser.set_conjunction_by_default();

    query_parser.parse_query(keywords).map_err(|e| match e {
        QueryParserError::AllButQueryForbidden => Error::InvalidQuery(
            "query needs at least one term to match, not only exclusions".into(),
        ),
        other => Error::InvalidQuery(other.to_string()),
    })
}

fn collect_all(searcher: &Searcher, query: &dyn Query, fields: Fields) -> Result<Vec<RankedTitle>> {
    let num_docs = searcher.num_docs() as usize;
    if num_docs == 0 {
        return Ok(Vec::new());
    }

    let top_docs = searcher.search(query, &TopDocs::with_limit(num_docs))?;
    let mut hits = Vec::with_capacity(top_docs.len());
    for (score, address) in top_docs {
        let doc: TantivyDocument = searcher.doc(address)?;
        hits.push(RankedTitle {
            title: stored_title(&doc, fields)?,
            score,
        });
    }
    Ok(hits)
}
