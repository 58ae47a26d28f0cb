//! 词袋文档检索器
//!
//! 按空白分词构建词表和文档-词项矩阵，用余弦相似度给文档排序，
//! 检索结果作为生成时的上下文。

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use ndarray::{Array1, Array2};
use serde::Serialize;

use crate::error::{ModelError, Result};

fn tokenize(text: &str) -> impl Iterator<Item = &str> {
    text.split_whitespace()
}

/// 词表
///
/// 索引按词频降序分配；词频相同时按在语料中首次出现的顺序。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Vocabulary {
    word_to_index: HashMap<String, usize>,
    words: Vec<String>,
    frequencies: Vec<usize>,
}

impl Vocabulary {
    /// 从语料构建词表
    pub fn build<S: AsRef<str>>(corpus: &[S]) -> Self {
        // 按首次出现顺序计数
        let mut first_seen: HashMap<&str, usize> = HashMap::new();
        let mut counts: Vec<(&str, usize)> = Vec::new();

        for doc in corpus {
            for word in tokenize(doc.as_ref()) {
                match first_seen.get(word) {
                    Some(&slot) => counts[slot].1 += 1,
                    None => {
                        first_seen.insert(word, counts.len());
                        counts.push((word, 1));
                    }
                }
            }
        }

        // 稳定排序：词频相同的词保持首次出现顺序
        counts.sort_by(|a, b| b.1.cmp(&a.1));

        let mut vocab = Self::default();
        for (word, count) in counts {
            vocab.word_to_index.insert(word.to_string(), vocab.words.len());
            vocab.words.push(word.to_string());
            vocab.frequencies.push(count);
        }

        vocab
    }

    pub fn index_of(&self, word: &str) -> Option<usize> {
        self.word_to_index.get(word).copied()
    }

    pub fn word(&self, index: usize) -> Option<&str> {
        self.words.get(index).map(String::as_str)
    }

    /// 词在语料中出现的总次数
    pub fn frequency(&self, index: usize) -> Option<usize> {
        self.frequencies.get(index).copied()
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// 按索引顺序遍历所有词
    pub fn words(&self) -> impl Iterator<Item = &str> {
        self.words.iter().map(String::as_str)
    }

    /// 文本在该词表上的词频向量，未登录词被忽略
    pub fn count_vector(&self, text: &str) -> Array1<f32> {
        let mut counts = Array1::zeros(self.len());
        for index in tokenize(text).filter_map(|word| self.index_of(word)) {
            counts[index] += 1.0;
        }
        counts
    }
}

/// L2 归一化；零向量保持为零
fn l2_normalize(mut v: ndarray::ArrayViewMut1<'_, f32>) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v /= norm;
    }
}

/// 一条检索结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalHit {
    /// 文档在语料中的位置
    pub index: usize,
    /// 余弦相似度；查询与词表无交集时为 0
    pub score: f32,
    pub text: String,
}

/// 不可变的检索索引
///
/// 每次重建都生成一个新的索引，从不局部修改。
#[derive(Debug, Clone, Default)]
pub struct RetrievalIndex {
    documents: Vec<String>,
    vocabulary: Vocabulary,
    /// 文档-词项矩阵 [num_documents, vocab_size]，每行 L2 归一化
    matrix: Array2<f32>,
}

impl RetrievalIndex {
    pub fn build<S: AsRef<str>>(corpus: &[S]) -> Self {
        let vocabulary = Vocabulary::build(corpus);
        let mut matrix = Array2::zeros((corpus.len(), vocabulary.len()));

        for (mut row, doc) in matrix.rows_mut().into_iter().zip(corpus) {
            row.assign(&vocabulary.count_vector(doc.as_ref()));
            l2_normalize(row);
        }

        Self {
            documents: corpus.iter().map(|d| d.as_ref().to_string()).collect(),
            vocabulary,
            matrix,
        }
    }

    /// 查询向量：在现有词表上计数并归一化
    pub fn vectorize(&self, query: &str) -> Array1<f32> {
        let mut v = self.vocabulary.count_vector(query);
        l2_normalize(v.view_mut());
        v
    }

    /// 查询与每个文档的余弦相似度，按语料顺序排列
    pub fn similarities(&self, query: &str) -> Array1<f32> {
        self.matrix.dot(&self.vectorize(query))
    }

    /// 相似度最高的 k 个文档；分数相同时语料中靠前的优先
    pub fn rank(&self, query: &str, k: usize) -> Result<Vec<RetrievalHit>> {
        if k == 0 {
            return Err(ModelError::Range {
                what: "k",
                value: k,
                valid: "1..".to_string(),
            });
        }

        let scores = self.similarities(query);
        let mut order: Vec<usize> = (0..self.documents.len()).collect();
        order.sort_by(|&a, &b| {
            scores[b]
                .partial_cmp(&scores[a])
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.cmp(&b))
        });

        Ok(order
            .into_iter()
            .take(k)
            .map(|index| RetrievalHit {
                index,
                score: scores[index],
                text: self.documents[index].clone(),
            })
            .collect())
    }

    pub fn documents(&self) -> &[String] {
        &self.documents
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    pub fn matrix(&self) -> &Array2<f32> {
        &self.matrix
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

/// 文档检索器
///
/// 索引放在 `RwLock<Arc<_>>` 中：`index` 在锁外构建新索引后整体替换，
/// `retrieve` 只克隆 `Arc`，因此并发检索永远看不到半成品索引。
#[derive(Debug, Default)]
pub struct DocumentRetriever {
    index: RwLock<Arc<RetrievalIndex>>,
}

impl DocumentRetriever {
    pub fn new() -> Self {
        Self::default()
    }

    /// 用语料创建并索引
    pub fn from_corpus<S: AsRef<str>>(corpus: &[S]) -> Self {
        let retriever = Self::new();
        retriever.index(corpus);
        retriever
    }

    /// 重建索引
    pub fn index<S: AsRef<str>>(&self, corpus: &[S]) {
        if corpus.is_empty() {
            tracing::warn!("indexing an empty corpus; every query will return no documents");
        }

        let fresh = Arc::new(RetrievalIndex::build(corpus));
        tracing::info!(
            documents = fresh.len(),
            vocab_size = fresh.vocabulary().len(),
            "rebuilt retrieval index"
        );

        *self.index.write().unwrap_or_else(PoisonError::into_inner) = fresh;
    }

    /// 当前索引的快照
    pub fn snapshot(&self) -> Arc<RetrievalIndex> {
        Arc::clone(&self.index.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// 检索最相关的 k 个文档
    ///
    /// k 大于语料大小时返回全部文档；k 为 0 时返回 `Range` 错误。
    pub fn retrieve(&self, query: &str, k: usize) -> Result<Vec<String>> {
        Ok(self
            .retrieve_scored(query, k)?
            .into_iter()
            .map(|hit| hit.text)
            .collect())
    }

    /// 带分数的检索结果
    ///
    /// 查询与词表没有交集时所有分数为 0，调用方需要自己检查分数来判断"无匹配"。
    pub fn retrieve_scored(&self, query: &str, k: usize) -> Result<Vec<RetrievalHit>> {
        let hits = self.snapshot().rank(query, k)?;
        tracing::debug!(k, returned = hits.len(), "retrieved documents");
        Ok(hits)
    }

    /// 检索增强：把检索到的文档拼接在查询之前，作为生成的上下文
    pub fn augment(&self, query: &str, k: usize) -> Result<String> {
        let mut parts = self.retrieve(query, k)?;
        parts.push(query.to_string());
        Ok(parts.join(" "))
    }

    /// 当前词表的副本
    pub fn vocabulary(&self) -> Vocabulary {
        self.snapshot().vocabulary().clone()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }
}
