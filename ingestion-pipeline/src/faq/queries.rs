//! Read side of FAQ bases: paged listing, single lookups and similarity
//! search with optional tag priorities.

use std::collections::{HashMap, HashSet};

use common::{
    error::AppError,
    storage::types::{
        chunk::{Chunk, ChunkType, FaqChunkFilter},
        faq::FaqEntry,
        knowledge::Knowledge,
        knowledge_base::KnowledgeBase,
        tag::KnowledgeTag,
    },
};
use tracing::{debug, instrument};

use super::faq_entry;
use crate::{
    engine::KnowledgeEngine,
    services::{SearchHit, SearchParams},
};

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 1000;
pub const DEFAULT_SEARCH_THRESHOLD: f64 = 0.7;
pub const DEFAULT_MATCH_COUNT: usize = 10;
pub const MAX_MATCH_COUNT: usize = 50;

/// Paging and filters for listing FAQ entries. Pages start at 1.
#[derive(Debug, Clone, Default)]
pub struct FaqListQuery {
    pub page: usize,
    pub page_size: usize,
    /// Seq id of a tag to filter on; 0 lists every tag.
    pub tag_seq_id: i64,
    pub keyword: String,
}

impl FaqListQuery {
    fn page(&self) -> usize {
        self.page.max(1)
    }

    fn page_size(&self) -> usize {
        match self.page_size {
            0 => DEFAULT_PAGE_SIZE,
            size => size.min(MAX_PAGE_SIZE),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FaqPage {
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
    pub entries: Vec<FaqEntry>,
}

#[derive(Debug, Clone, Default)]
pub struct FaqSearchRequest {
    pub query: String,
    /// Minimum similarity; 0 or less uses the default.
    pub vector_threshold: f64,
    /// 0 uses the default; larger values are capped.
    pub match_count: usize,
    /// Tag seq ids whose entries rank ahead of everything else.
    pub first_priority_tag_ids: Vec<i64>,
    /// Tag seq ids ranked after the first priority tags.
    pub second_priority_tag_ids: Vec<i64>,
    pub only_recommended: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FaqSearchHit {
    pub entry: FaqEntry,
    pub score: f64,
    /// Indexed text that matched, e.g. one similar question.
    pub matched_content: String,
}

impl KnowledgeEngine {
    #[instrument(skip_all, fields(tenant_id = tenant_id, kb_id = %kb_id, page = query.page))]
    pub async fn list_faq_entries(
        &self,
        tenant_id: u64,
        kb_id: &str,
        query: &FaqListQuery,
    ) -> Result<FaqPage, AppError> {
        let kb = self.faq_knowledge_base(tenant_id, kb_id).await?;
        let (page, page_size) = (query.page(), query.page_size());
        let empty = FaqPage {
            total: 0,
            page,
            page_size,
            entries: Vec::new(),
        };
        if Knowledge::find_faq_container(&self.db, tenant_id, &kb.id)
            .await?
            .is_none()
        {
            return Ok(empty);
        }

        let mut filter = FaqChunkFilter {
            keyword: query.keyword.clone(),
            ..FaqChunkFilter::default()
        };
        if query.tag_seq_id > 0 {
            let tag = KnowledgeTag::get_by_seq_id(&self.db, tenant_id, query.tag_seq_id)
                .await?
                .ok_or_else(|| AppError::NotFound("标签不存在".into()))?;
            filter.tag_id = tag.id;
        }

        let start = page.saturating_sub(1).saturating_mul(page_size);
        let (chunks, total) = Chunk::page_faq_by_knowledge_base(
            &self.db, tenant_id, &kb.id, &filter, start, page_size,
        )
        .await?;
        let tags = self.tags_by_id(&kb).await?;
        let entries = chunks
            .iter()
            .map(|chunk| faq_entry(&kb, chunk, tags.get(&chunk.tag_id)))
            .collect();
        Ok(FaqPage {
            total,
            entries,
            ..empty
        })
    }

    pub async fn get_faq_entry(
        &self,
        tenant_id: u64,
        kb_id: &str,
        seq_id: i64,
    ) -> Result<FaqEntry, AppError> {
        if seq_id <= 0 {
            return Err(AppError::BadRequest("条目ID不能为空".into()));
        }
        let kb = self.faq_knowledge_base(tenant_id, kb_id).await?;
        let not_found = || AppError::NotFound("FAQ条目不存在".into());
        let chunk = Chunk::get_by_seq_id(&self.db, tenant_id, seq_id)
            .await?
            .ok_or_else(not_found)?;
        if chunk.knowledge_base_id != kb.id || chunk.chunk_type != ChunkType::Faq {
            return Err(not_found());
        }
        let tag = KnowledgeTag::get_by_id(&self.db, tenant_id, &chunk.tag_id).await?;
        Ok(faq_entry(&kb, &chunk, tag.as_ref()))
    }

    /// Enabled entries closest to the query. With priority tags, each tier
    /// is searched on its own so a strong lower tier cannot crowd it out,
    /// and results are ordered by tier before score.
    #[instrument(skip_all, fields(tenant_id = tenant_id, kb_id = %kb_id))]
    pub async fn search_faq_entries(
        &self,
        tenant_id: u64,
        kb_id: &str,
        request: &FaqSearchRequest,
    ) -> Result<Vec<FaqSearchHit>, AppError> {
        let kb = self.faq_knowledge_base(tenant_id, kb_id).await?;
        let query = request.query.trim();
        if query.is_empty() {
            return Err(AppError::BadRequest("查询内容不能为空".into()));
        }
        let threshold = if request.vector_threshold > 0.0 {
            request.vector_threshold
        } else {
            DEFAULT_SEARCH_THRESHOLD
        };
        let match_count = match request.match_count {
            0 => DEFAULT_MATCH_COUNT,
            count => count.min(MAX_MATCH_COUNT),
        };

        let first = self
            .tag_ids_for_seq_ids(&kb, &request.first_priority_tag_ids)
            .await?;
        let second = self
            .tag_ids_for_seq_ids(&kb, &request.second_priority_tag_ids)
            .await?;
        let model = self.embedding_model(&kb).await?;
        let retrieval = &self.services.retrieval;
        let search = |tag_ids: Vec<String>| {
            let params = SearchParams {
                knowledge_base_id: kb.id.clone(),
                query: query.to_string(),
                vector_threshold: threshold,
                match_count,
                tag_ids,
            };
            let model = &model;
            async move { retrieval.search(tenant_id, model.as_ref(), &params).await }
        };

        let hits: Vec<SearchHit> = if first.is_empty() && second.is_empty() {
            search(Vec::new()).await?
        } else {
            let tier = |ids: &HashSet<String>| ids.iter().cloned().collect::<Vec<_>>();
            let (first_hits, second_hits) = futures::try_join!(
                async {
                    if first.is_empty() {
                        return Ok(Vec::new());
                    }
                    search(tier(&first)).await
                },
                async {
                    if second.is_empty() {
                        return Ok(Vec::new());
                    }
                    search(tier(&second)).await
                },
            )?;
            let mut seen = HashSet::new();
            first_hits
                .into_iter()
                .chain(second_hits)
                .filter(|hit| seen.insert(hit.chunk_id.clone()))
                .collect()
        };
        if hits.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = hits.iter().map(|hit| hit.chunk_id.clone()).collect();
        let chunks: HashMap<String, Chunk> = Chunk::list_by_ids(&self.db, &ids)
            .await?
            .into_iter()
            .filter(|c| {
                c.tenant_id == tenant_id
                    && c.knowledge_base_id == kb.id
                    && c.chunk_type == ChunkType::Faq
                    && c.is_enabled
                    && (!request.only_recommended || c.is_recommended())
            })
            .map(|c| (c.id.clone(), c))
            .collect();
        let tags = self.tags_by_id(&kb).await?;
        let tier_of = |chunk: &Chunk| {
            if first.contains(&chunk.tag_id) {
                0
            } else if second.contains(&chunk.tag_id) {
                1
            } else {
                2
            }
        };

        let mut ranked: Vec<(u8, FaqSearchHit)> = hits
            .into_iter()
            .filter_map(|hit| {
                let chunk = chunks.get(&hit.chunk_id)?;
                Some((
                    tier_of(chunk),
                    FaqSearchHit {
                        entry: faq_entry(&kb, chunk, tags.get(&chunk.tag_id)),
                        score: hit.score,
                        matched_content: hit.matched_content,
                    },
                ))
            })
            .collect();
        ranked.sort_by(|(tier_a, a), (tier_b, b)| {
            tier_a.cmp(tier_b).then_with(|| b.score.total_cmp(&a.score))
        });
        ranked.truncate(match_count);
        debug!(hits = ranked.len(), "searched FAQ entries");
        Ok(ranked.into_iter().map(|(_, hit)| hit).collect())
    }

    /// Every tag of the base keyed by id.
    async fn tags_by_id(&self, kb: &KnowledgeBase) -> Result<HashMap<String, KnowledgeTag>, AppError> {
        Ok(
            KnowledgeTag::list_by_knowledge_base(&self.db, kb.tenant_id, &kb.id)
                .await?
                .into_iter()
                .map(|tag| (tag.id.clone(), tag))
                .collect(),
        )
    }

    /// Ids of the base's tags among `seq_ids`; unknown seq ids are ignored.
    async fn tag_ids_for_seq_ids(
        &self,
        kb: &KnowledgeBase,
        seq_ids: &[i64],
    ) -> Result<HashSet<String>, AppError> {
        let mut ids = HashSet::new();
        for &seq_id in seq_ids.iter().filter(|id| **id > 0) {
            if let Some(tag) = KnowledgeTag::get_by_seq_id(&self.db, kb.tenant_id, seq_id).await? {
                if tag.knowledge_base_id == kb.id {
                    ids.insert(tag.id);
                }
            }
        }
        Ok(ids)
    }
}
