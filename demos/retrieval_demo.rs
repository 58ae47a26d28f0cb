//! 检索 + 编码示例
//!
//! 展示如何索引语料、检索上下文，并把拼接后的文本送入编码器
//!
//! 运行：`RUST_LOG=debug cargo run --example retrieval_demo`

use std::error::Error;

use mini_rag_transformer::{
    configs, AttentionMask, DocumentRetriever, Mode, StateDict, TransformerEncoder,
};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("╔════════════════════════════════════════════════╗");
    println!("║   Mini RAG Transformer：检索 + 编码            ║");
    println!("╚════════════════════════════════════════════════╝\n");

    // ============ 1. 索引语料 ============
    let corpus = [
        "the transformer uses self attention",
        "attention weights sum to one",
        "dropout is disabled during inference",
        "the retriever ranks documents by cosine similarity",
    ];
    let retriever = DocumentRetriever::from_corpus(&corpus);
    println!("📚 已索引 {} 篇文档", retriever.len());
    println!("  词汇表大小: {}\n", retriever.vocabulary().len());

    // ============ 2. 检索 ============
    let query = "how does attention work";
    println!("🔍 查询: \"{}\"", query);
    for hit in retriever.retrieve_scored(query, 2)? {
        println!("  [{}] {:.3}  {}", hit.index, hit.score, hit.text);
    }

    let context = retriever.augment(query, 2)?;
    println!("\n📝 增强后的输入:\n  {}\n", context);

    // ============ 3. 编码 ============
    let config = configs::tiny();
    let mut rng = StdRng::seed_from_u64(42);
    let model = TransformerEncoder::new(config, &mut rng)?;
    println!("{}\n", model.info());

    // 用检索器的词表把文本映射为 token ID，未登录词映射为 0
    let vocab = retriever.vocabulary();
    let mut ids: Vec<usize> = context
        .split_whitespace()
        .map(|w| vocab.index_of(w).map_or(0, |i| (i + 1) % config.vocab_size))
        .collect();
    ids.truncate(config.max_seq_len);
    let seq_len = ids.len();
    let tokens = Array2::from_shape_vec((1, seq_len), ids)?;
    let mask = AttentionMask::all(1, seq_len);

    let output = model.forward(&tokens, Some(&mask), &mut Mode::Inference)?;
    println!("🧮 logits 形状: {:?}", output.logits.shape());
    println!("  注意力层数: {}", output.attention_weights.len());
    if let Some(first) = output.attention_weights.first() {
        println!("  第 1 层注意力形状: {:?}", first.shape());
    }

    // 训练模式：dropout 使用显式传入的随机源
    let mut dropout_rng = StdRng::seed_from_u64(7);
    let training = model.forward(&tokens, None, &mut Mode::Training(&mut dropout_rng))?;
    println!("  训练模式 logits 形状: {:?}", training.logits.shape());

    println!("\n🔮 预测: {:?}", model.predict(&tokens, None)?.row(0).to_vec());

    // ============ 4. 参数快照 ============
    let snapshot = model.state_dict();
    println!(
        "\n💾 参数快照: {} 个张量, {} 个参数, bincode {} 字节",
        snapshot.len(),
        snapshot.total_elements(),
        snapshot.to_bytes()?.len()
    );

    Ok(())
}
