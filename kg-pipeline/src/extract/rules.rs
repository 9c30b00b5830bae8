use std::collections::HashSet;
use std::sync::LazyLock;

use async_trait::async_trait;
use common::error::AppError;
use regex::Regex;
use tracing::debug;

use crate::types::{byte_to_char_offset, AlignedEntity, EntityMention, Triple};

use super::{mention_id, sanitize_type, EntityExtractor, RelationExtractor};

macro_rules! bank_regex {
    ($pattern:expr) => {{
        #[allow(clippy::unwrap_used)]
        Regex::new($pattern).unwrap()
    }};
}

/// Base entity patterns, applied on every run.
static BASE_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    vec![
        // CJK person names: common surname followed by a 1-2 char given name
        (
            bank_regex!(
                "(?:王|李|张|刘|陈|杨|黄|赵|吴|周|徐|孙|马|朱|胡|郭|何|林|罗|高|郑|梁|谢|宋|唐|许|韩|冯|邓|曹|彭|曾|肖|田|董|袁|潘|蒋|蔡|余|杜|叶|程|苏|魏|吕|丁|任|沈|姚|卢|姜|崔|钟|谭|陆|汪|范|金|石|廖|贾|夏|傅|方|邹|孟|熊|秦|邱|江|尹|薛|闫|段|雷|侯|龙|陶|黎|贺|顾|毛|郝|邵|万|钱|严|武|戴|莫|孔|向|汤)[\\x{4e00}-\\x{9fa5}]{1,2}"
            ),
            "人物",
        ),
        // English capitalized bigrams
        (bank_regex!(r"\b[A-Z][a-z]+ [A-Z][a-z]+\b"), "Person"),
        // Organizations by suffix
        (
            bank_regex!(
                "[\\x{4e00}-\\x{9fa5}A-Za-z0-9]{2,12}(?:公司|集团|大学|学院|研究院|研究所|实验室|银行|医院)"
            ),
            "组织",
        ),
        (
            bank_regex!(r"\b[A-Z][A-Za-z0-9&]+(?: [A-Z][A-Za-z0-9&]+)* (?:Inc|Corp|Ltd|LLC|Company|University)\b"),
            "Organization",
        ),
        // Locations by suffix
        (
            bank_regex!("[\\x{4e00}-\\x{9fa5}]{1,8}(?:省|市|县|区|镇|乡|村|街道)"),
            "地点",
        ),
        // Dates in several shapes
        (
            bank_regex!(r"\d{4}年(?:\d{1,2}月)?(?:\d{1,2}日)?|\d{4}[-/.]\d{1,2}[-/.]\d{1,2}"),
            "时间",
        ),
        // Curated technology terms
        (
            bank_regex!(
                "(?:人工智能|机器学习|深度学习|神经网络|大语言模型|大模型|知识图谱|自然语言处理|语音识别|计算机视觉|云计算|大数据|区块链|物联网|文心一言|通义千问|ChatGPT|GPT-4|Transformer)"
            ),
            "技术",
        ),
    ]
});

/// Patterns only applied under `force_extend` or when the base bank comes
/// back empty.
static EXTENDED_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    vec![
        (
            bank_regex!("[\\x{4e00}-\\x{9fa5}A-Za-z0-9]{2,12}(?:系统|平台|软件|应用|芯片|手机)"),
            "产品",
        ),
        (
            bank_regex!("[\\x{4e00}-\\x{9fa5}]{2,12}(?:大会|会议|峰会|论坛|发布会)"),
            "事件",
        ),
        (
            bank_regex!(r"\d+(?:\.\d+)?(?:亿|万|千)?(?:元|美元|人次|台|辆)"),
            "数值",
        ),
        (
            bank_regex!("(?:董事长|首席执行官|CEO|CTO|总裁|总经理|创始人|工程师|科学家)"),
            "职位",
        ),
    ]
});

/// Final sweep: bare 2-5 char CJK nouns, stopword-filtered.
static NOUN_SWEEP: LazyLock<Regex> =
    LazyLock::new(|| bank_regex!("[\\x{4e00}-\\x{9fa5}]{2,5}"));

static STOPWORDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "我们", "你们", "他们", "这个", "那个", "这些", "那些", "一个", "什么", "时候",
        "现在", "已经", "正在", "可以", "没有", "不是", "就是", "但是", "因为", "所以",
        "如果", "然后", "同时", "通过", "以及", "并且", "其中", "目前", "进行", "实现",
        "使用", "提供", "支持", "包括", "相关", "方面", "问题", "情况", "工作", "发展",
        "研究", "表示", "认为", "成为", "推出", "发布", "领导", "负责",
    ]
    .into_iter()
    .collect()
});

/// Context words that suffix patterns tend to swallow on their left edge;
/// names are trimmed to the segment after the last one.
const CONTEXT_DELIMITERS: &[&str] = &[
    "领导", "带领", "负责", "推出", "发布", "研发", "研制", "包括", "包含", "表示",
    "担任", "任职于", "属于", "成立", "是", "于", "在", "与", "和", "同", "的", "了",
];

/// Entity char class for relation captures: CJK, latin and digits.
const ENTITY_SPAN: &str = "[\\x{4e00}-\\x{9fa5}A-Za-z0-9]{2,16}";

struct RelationRule {
    pattern: Regex,
    /// Indices of (head, tail) captures; relation label construction is
    /// rule-specific.
    kind: RuleKind,
}

enum RuleKind {
    /// `X 与/和/同 Y 合作` family, fixed label.
    Cooperation,
    /// Plain `X <verb> Y`, the verb is the label (capture 2).
    Verb,
    /// `X 于 TIME <verb> Y`, label is 于 + time + verb.
    TimedVerb,
}

static RELATION_RULES: LazyLock<Vec<RelationRule>> = LazyLock::new(|| {
    vec![
        RelationRule {
            pattern: bank_regex!(&format!(
                "({ENTITY_SPAN})(?:与|和|同)({ENTITY_SPAN})(?:达成战略合作|达成合作|战略合作|合作)"
            )),
            kind: RuleKind::Cooperation,
        },
        RelationRule {
            pattern: bank_regex!(&format!(
                "({ENTITY_SPAN})(?:于|在)(\\d{{4}}年(?:\\d{{1,2}}月)?(?:\\d{{1,2}}日)?)(推出|发布|成立)({ENTITY_SPAN})"
            )),
            kind: RuleKind::TimedVerb,
        },
        RelationRule {
            pattern: bank_regex!(&format!("({ENTITY_SPAN})(推出|发布|研发|研制)({ENTITY_SPAN})")),
            kind: RuleKind::Verb,
        },
        RelationRule {
            pattern: bank_regex!(&format!("({ENTITY_SPAN})(是|属于|任职于|担任)({ENTITY_SPAN})")),
            kind: RuleKind::Verb,
        },
        RelationRule {
            pattern: bank_regex!(&format!("({ENTITY_SPAN})(领导|带领|负责)({ENTITY_SPAN})")),
            kind: RuleKind::Verb,
        },
        RelationRule {
            pattern: bank_regex!(&format!("({ENTITY_SPAN})(包括|包含)({ENTITY_SPAN})")),
            kind: RuleKind::Verb,
        },
        RelationRule {
            pattern: bank_regex!(&format!("({ENTITY_SPAN})(表示|称|说)({ENTITY_SPAN})")),
            kind: RuleKind::Verb,
        },
    ]
});

/// Regex bank over person/organization/location/date/technology shapes,
/// with product/event/number/title patterns and a CJK noun sweep held back
/// for fallback use.
pub struct RuleEntityExtractor {
    force_extend: bool,
}

impl RuleEntityExtractor {
    pub fn new(force_extend: bool) -> Self {
        Self { force_extend }
    }

    fn apply_patterns(
        text: &str,
        patterns: &[(Regex, &'static str)],
        covered: &mut Vec<(usize, usize)>,
        skip_covered: bool,
        mentions: &mut Vec<EntityMention>,
    ) {
        for (pattern, entity_type) in patterns {
            for found in pattern.find_iter(text) {
                let start = byte_to_char_offset(text, found.start());
                let end = byte_to_char_offset(text, found.end());
                if skip_covered && overlaps(covered, start, end) {
                    continue;
                }

                let (name, trimmed_chars) = trim_leading_context(found.as_str());
                if name.chars().count() < 2 {
                    continue;
                }
                let start = start + trimmed_chars;

                if mentions
                    .iter()
                    .any(|m| m.name == name && m.start_pos == start)
                {
                    continue;
                }

                covered.push((start, end));
                mentions.push(EntityMention {
                    id: mention_id(),
                    name,
                    entity_type: sanitize_type(entity_type),
                    start_pos: start,
                    end_pos: end,
                    confidence: None,
                });
            }
        }
    }

    fn sweep_nouns(
        text: &str,
        covered: &[(usize, usize)],
        mentions: &mut Vec<EntityMention>,
    ) {
        for found in NOUN_SWEEP.find_iter(text) {
            let name = found.as_str();
            if STOPWORDS.contains(name) {
                continue;
            }
            let start = byte_to_char_offset(text, found.start());
            let end = byte_to_char_offset(text, found.end());
            if overlaps(covered, start, end) {
                continue;
            }
            if mentions.iter().any(|m| m.name == name) {
                continue;
            }
            mentions.push(EntityMention {
                id: mention_id(),
                name: name.to_string(),
                entity_type: "名词".to_string(),
                start_pos: start,
                end_pos: end,
                confidence: None,
            });
        }
    }
}

#[async_trait]
impl EntityExtractor for RuleEntityExtractor {
    fn describe(&self) -> &'static str {
        if self.force_extend {
            "local-bank"
        } else {
            "rule-bank"
        }
    }

    async fn extract(&self, text: &str) -> Result<Vec<EntityMention>, AppError> {
        let mut mentions = Vec::new();
        let mut covered: Vec<(usize, usize)> = Vec::new();

        Self::apply_patterns(text, &BASE_PATTERNS, &mut covered, false, &mut mentions);

        if self.force_extend || mentions.is_empty() {
            Self::apply_patterns(text, &EXTENDED_PATTERNS, &mut covered, true, &mut mentions);
            Self::sweep_nouns(text, &covered, &mut mentions);
        }

        debug!(mentions = mentions.len(), "rule bank extraction finished");
        Ok(mentions)
    }
}

fn overlaps(covered: &[(usize, usize)], start: usize, end: usize) -> bool {
    covered.iter().any(|(s, e)| start < *e && *s < end)
}

/// Cuts swallowed left context ("王海峰领导百度研究院" -> "百度研究院").
/// Returns the trimmed name and how many characters were removed.
fn trim_leading_context(name: &str) -> (String, usize) {
    let mut cut_end = 0usize;
    for delimiter in CONTEXT_DELIMITERS {
        if let Some(pos) = name.rfind(delimiter) {
            cut_end = cut_end.max(pos + delimiter.len());
        }
    }

    if cut_end == 0 {
        return (name.to_string(), 0);
    }

    match name.get(cut_end..) {
        Some(rest) if rest.chars().count() >= 2 => {
            let removed = byte_to_char_offset(name, cut_end);
            (rest.to_string(), removed)
        }
        _ => (name.to_string(), 0),
    }
}

/// Compiled verb-phrase patterns; fired captures are resolved to canonical
/// ids through an exact -> substring -> fuzzy -> reverse-fuzzy cascade.
pub struct RuleRelationExtractor;

impl RuleRelationExtractor {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RuleRelationExtractor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RelationExtractor for RuleRelationExtractor {
    fn describe(&self) -> &'static str {
        "rule-bank"
    }

    async fn extract(
        &self,
        text: &str,
        entities: &[AlignedEntity],
    ) -> Result<Vec<Triple>, AppError> {
        let mut triples: Vec<Triple> = Vec::new();
        let mut seen: HashSet<(String, String, String)> = HashSet::new();

        for rule in RELATION_RULES.iter() {
            for captures in rule.pattern.captures_iter(text) {
                let (head_text, relation, tail_text) = match rule.kind {
                    RuleKind::Cooperation => {
                        let head = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
                        let tail = captures.get(2).map(|m| m.as_str()).unwrap_or_default();
                        (head, "合作".to_string(), tail)
                    }
                    RuleKind::Verb => {
                        let head = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
                        let verb = captures.get(2).map(|m| m.as_str()).unwrap_or_default();
                        let tail = captures.get(3).map(|m| m.as_str()).unwrap_or_default();
                        (head, verb.to_string(), tail)
                    }
                    RuleKind::TimedVerb => {
                        let head = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
                        let time = captures.get(2).map(|m| m.as_str()).unwrap_or_default();
                        let verb = captures.get(3).map(|m| m.as_str()).unwrap_or_default();
                        let tail = captures.get(4).map(|m| m.as_str()).unwrap_or_default();
                        (head, format!("于{time}{verb}"), tail)
                    }
                };

                let symmetric = is_symmetric(&relation);
                let Some(head) = resolve_capture(head_text, entities, symmetric) else {
                    debug!(capture = head_text, %relation, "unmatched head capture dropped");
                    continue;
                };
                let Some(tail) = resolve_capture(tail_text, entities, symmetric) else {
                    debug!(capture = tail_text, %relation, "unmatched tail capture dropped");
                    continue;
                };

                let key = (head.id.clone(), relation.clone(), tail.id.clone());
                if seen.insert(key) {
                    triples.push(Triple::extracted(
                        head.id.clone(),
                        relation.clone(),
                        tail.id.clone(),
                    ));
                }
            }
        }

        Ok(triples)
    }
}

fn is_symmetric(relation: &str) -> bool {
    ["合作", "与", "和", "同"]
        .iter()
        .any(|marker| relation.contains(marker))
}

/// Exact name -> substring (longest canonical first) -> fuzzy >= 0.65 ->
/// reverse-fuzzy (windowed, symmetric relations only).
fn resolve_capture<'a>(
    capture: &str,
    entities: &'a [AlignedEntity],
    symmetric: bool,
) -> Option<&'a AlignedEntity> {
    if capture.chars().count() < 2 {
        return None;
    }

    if let Some(entity) = entities.iter().find(|e| e.name == capture) {
        return Some(entity);
    }

    // containment, preferring a name sitting at the start of the capture
    // (the head of a swallowed span), then the longest name
    let mut contained: Option<(&AlignedEntity, (bool, usize))> = None;
    for entity in entities {
        if !capture.contains(&entity.name) && !entity.name.contains(capture) {
            continue;
        }
        let rank = (
            capture.starts_with(&entity.name),
            entity.name.chars().count(),
        );
        if contained.map_or(true, |(_, best)| rank > best) {
            contained = Some((entity, rank));
        }
    }
    if let Some((entity, _)) = contained {
        return Some(entity);
    }

    let mut best: Option<(&AlignedEntity, f64)> = None;
    for entity in entities {
        let score = strsim::normalized_levenshtein(&entity.name, capture);
        if best.map_or(true, |(_, b)| score > b) {
            best = Some((entity, score));
        }
    }
    if let Some((entity, score)) = best {
        if score >= 0.65 {
            return Some(entity);
        }
    }

    if symmetric {
        let mut best: Option<(&AlignedEntity, f64)> = None;
        for entity in entities {
            let score = windowed_similarity(&entity.name, capture);
            if best.map_or(true, |(_, b)| score > b) {
                best = Some((entity, score));
            }
        }
        if let Some((entity, score)) = best {
            if score >= 0.65 {
                return Some(entity);
            }
        }
    }

    None
}

/// Best Levenshtein similarity of `name` against any same-length character
/// window of `capture`.
fn windowed_similarity(name: &str, capture: &str) -> f64 {
    let name_chars: Vec<char> = name.chars().collect();
    let capture_chars: Vec<char> = capture.chars().collect();
    if name_chars.is_empty() || capture_chars.len() < name_chars.len() {
        return strsim::normalized_levenshtein(name, capture);
    }

    let mut best = 0.0f64;
    for window in capture_chars.windows(name_chars.len()) {
        let window: String = window.iter().collect();
        best = best.max(strsim::normalized_levenshtein(name, &window));
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aligned(id: &str, name: &str, entity_type: &str) -> AlignedEntity {
        AlignedEntity {
            id: id.to_string(),
            name: name.to_string(),
            entity_type: entity_type.to_string(),
            merged_ids: vec![id.to_string()],
            attributes: Default::default(),
        }
    }

    #[tokio::test]
    async fn base_bank_finds_people_orgs_and_tech() {
        let extractor = RuleEntityExtractor::new(false);
        let text = "百度公司于2023年推出文心一言。王海峰领导百度研究院。";
        let mentions = extractor.extract(text).await.expect("extract");

        let names: Vec<&str> = mentions.iter().map(|m| m.name.as_str()).collect();
        assert!(names.contains(&"百度公司"), "got {names:?}");
        assert!(names.contains(&"文心一言"), "got {names:?}");
        assert!(names.contains(&"王海峰"), "got {names:?}");
        assert!(names.contains(&"百度研究院"), "got {names:?}");
    }

    #[tokio::test]
    async fn mention_offsets_locate_the_name() {
        let extractor = RuleEntityExtractor::new(false);
        let text = "百度公司于2023年推出文心一言。";
        let mentions = extractor.extract(text).await.expect("extract");

        for mention in &mentions {
            assert!(mention.start_pos < mention.end_pos);
            let slice =
                crate::types::char_slice(text, mention.start_pos, mention.end_pos).unwrap_or_default();
            assert!(
                slice.contains(&mention.name) || mention.name.contains(slice.trim()),
                "span {slice:?} does not cover {:?}",
                mention.name
            );
        }
    }

    #[tokio::test]
    async fn sweep_only_runs_when_base_is_empty_or_forced() {
        let plain = RuleEntityExtractor::new(false);
        let forced = RuleEntityExtractor::new(true);
        // no base pattern matches this
        let text = "桌子椅子沙发";

        let base_only = plain.extract(text).await.expect("extract");
        assert!(!base_only.is_empty(), "empty base triggers the sweep");

        let forced_out = forced.extract(text).await.expect("extract");
        assert!(!forced_out.is_empty());
    }

    #[tokio::test]
    async fn english_bigrams_and_org_suffixes_match() {
        let extractor = RuleEntityExtractor::new(false);
        let text = "John Smith joined Acme Corp last year.";
        let mentions = extractor.extract(text).await.expect("extract");
        let names: Vec<&str> = mentions.iter().map(|m| m.name.as_str()).collect();
        assert!(names.contains(&"John Smith"));
        assert!(names.contains(&"Acme Corp"));
    }

    #[test]
    fn leading_context_is_trimmed() {
        assert_eq!(
            trim_leading_context("王海峰领导百度研究院").0,
            "百度研究院"
        );
        assert_eq!(trim_leading_context("百度公司").0, "百度公司");
    }

    #[tokio::test]
    async fn relation_rules_fire_verbs() {
        let entities = vec![
            aligned("e1", "百度公司", "组织"),
            aligned("e2", "文心一言", "技术"),
            aligned("e3", "王海峰", "人物"),
            aligned("e4", "百度研究院", "组织"),
        ];
        let extractor = RuleRelationExtractor::new();
        let text = "百度公司于2023年推出文心一言。王海峰领导百度研究院。";
        let triples = extractor.extract(text, &entities).await.expect("extract");

        assert!(triples
            .iter()
            .any(|t| t.head_id == "e1" && t.relation == "推出" && t.tail_id == "e2"));
        assert!(triples
            .iter()
            .any(|t| t.head_id == "e3" && t.relation == "领导" && t.tail_id == "e4"));
    }

    #[tokio::test]
    async fn cooperation_pattern_yields_fixed_label() {
        let entities = vec![
            aligned("e1", "腾讯", "组织"),
            aligned("e2", "阿里巴巴", "组织"),
        ];
        let extractor = RuleRelationExtractor::new();
        let triples = extractor
            .extract("腾讯与阿里巴巴达成战略合作。", &entities)
            .await
            .expect("extract");

        assert_eq!(triples.len(), 1);
        assert_eq!(triples[0].relation, "合作");
        assert_eq!(triples[0].head_id, "e1");
        assert_eq!(triples[0].tail_id, "e2");
    }

    #[tokio::test]
    async fn unmatched_captures_are_dropped() {
        let entities = vec![aligned("e1", "华为", "组织")];
        let extractor = RuleRelationExtractor::new();
        let triples = extractor
            .extract("小米推出新款手机。", &entities)
            .await
            .expect("extract");
        assert!(triples.is_empty());
    }

    #[tokio::test]
    async fn duplicate_triples_collapse() {
        let entities = vec![
            aligned("e1", "百度公司", "组织"),
            aligned("e2", "文心一言", "技术"),
        ];
        let extractor = RuleRelationExtractor::new();
        let text = "百度公司推出文心一言。百度公司推出文心一言。";
        let triples = extractor.extract(text, &entities).await.expect("extract");
        assert_eq!(
            triples
                .iter()
                .filter(|t| t.relation == "推出")
                .count(),
            1
        );
    }

    #[test]
    fn capture_cascade_uses_substrings_then_fuzzy() {
        let entities = vec![
            aligned("e1", "百度公司", "组织"),
            aligned("e2", "清华大学", "组织"),
        ];

        // substring: capture swallowed trailing context
        let hit = resolve_capture("百度公司于2023年", &entities, false).expect("substring hit");
        assert_eq!(hit.id, "e1");

        // fuzzy: one char off
        let hit = resolve_capture("清华大孝", &entities, false).expect("fuzzy hit");
        assert_eq!(hit.id, "e2");

        assert!(resolve_capture("不相关实体", &entities, false).is_none());
    }

    #[test]
    fn capture_prefix_beats_embedded_names() {
        let entities = vec![
            aligned("org", "百度公司", "组织"),
            aligned("date", "2023年", "时间"),
        ];

        let hit =
            resolve_capture("百度公司于2023年", &entities, false).expect("containment hit");
        assert_eq!(hit.id, "org");
    }

    #[test]
    fn windowed_similarity_handles_embedded_names() {
        let score = windowed_similarity("阿里巴巴", "阿里巴巴集团控股");
        assert!(score > 0.99);
    }
}
