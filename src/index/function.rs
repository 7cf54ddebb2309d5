//! map / reduce 函数抽象与内置 reduce。
//!
//! 闭包直接实现函数 trait；编译器（`ViewCompiler`）把某种语言的源码编译成同样的 trait 对象。

use std::fmt;
use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::core::{Result, ViewError};

/// map 调用期间收集 emit 的行
#[derive(Debug, Default)]
pub struct Emitter {
    rows: Vec<(Value, Value)>,
}

impl Emitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&mut self, key: Value, value: Value) {
        self.rows.push((key, value));
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn into_rows(self) -> Vec<(Value, Value)> {
        self.rows
    }
}

pub trait MapFunction: Send + Sync {
    /// `doc` 为带 `_id` / `_rev` 的文档 JSON
    fn map(&self, doc: &Value, emitter: &mut Emitter) -> Result<()>;
}

impl<F> MapFunction for F
where
    F: Fn(&Value, &mut Emitter) -> Result<()> + Send + Sync,
{
    fn map(&self, doc: &Value, emitter: &mut Emitter) -> Result<()> {
        self(doc, emitter)
    }
}

pub trait ReduceFunction: Send + Sync {
    /// `rereduce == true` 时 `values` 是上一轮 reduce 的结果，`keys` 为空
    fn reduce(&self, keys: &[Value], values: &[Value], rereduce: bool) -> Result<Value>;
}

impl<F> ReduceFunction for F
where
    F: Fn(&[Value], &[Value], bool) -> Result<Value> + Send + Sync,
{
    fn reduce(&self, keys: &[Value], values: &[Value], rereduce: bool) -> Result<Value> {
        self(keys, values, rereduce)
    }
}

/// `_count` / `_sum` / `_stats`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinReduce {
    Count,
    Sum,
    Stats,
}

impl BuiltinReduce {
    pub fn parse(source: &str) -> Option<Self> {
        match source.trim() {
            "_count" => Some(Self::Count),
            "_sum" => Some(Self::Sum),
            "_stats" => Some(Self::Stats),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Count => "_count",
            Self::Sum => "_sum",
            Self::Stats => "_stats",
        }
    }
}

fn number(v: &Value, reducer: BuiltinReduce) -> Result<f64> {
    v.as_f64().ok_or_else(|| {
        ViewError::Callback(format!("{} cannot reduce non-numeric value {}", reducer.name(), v))
    })
}

/// 整数结果保持整数形态，避免 `2.0`
fn num_value(x: f64) -> Value {
    if x.fract() == 0.0 && x.abs() < (i64::MAX as f64) {
        json!(x as i64)
    } else {
        json!(x)
    }
}

#[derive(Debug, Clone, Copy)]
struct Stats {
    sum: f64,
    count: f64,
    min: f64,
    max: f64,
    sumsqr: f64,
}

impl Stats {
    fn of(x: f64) -> Self {
        Self {
            sum: x,
            count: 1.0,
            min: x,
            max: x,
            sumsqr: x * x,
        }
    }

    fn merge(self, o: Stats) -> Self {
        Self {
            sum: self.sum + o.sum,
            count: self.count + o.count,
            min: self.min.min(o.min),
            max: self.max.max(o.max),
            sumsqr: self.sumsqr + o.sumsqr,
        }
    }

    fn from_value(v: &Value) -> Result<Self> {
        let field = |name: &str| {
            v.get(name).and_then(Value::as_f64).ok_or_else(|| {
                ViewError::Callback(format!("_stats rereduce input missing {:?}", name))
            })
        };
        Ok(Self {
            sum: field("sum")?,
            count: field("count")?,
            min: field("min")?,
            max: field("max")?,
            sumsqr: field("sumsqr")?,
        })
    }

    fn to_value(self) -> Value {
        let mut m = Map::new();
        m.insert("sum".into(), num_value(self.sum));
        m.insert("count".into(), num_value(self.count));
        m.insert("min".into(), num_value(self.min));
        m.insert("max".into(), num_value(self.max));
        m.insert("sumsqr".into(), num_value(self.sumsqr));
        Value::Object(m)
    }
}

impl ReduceFunction for BuiltinReduce {
    fn reduce(&self, _keys: &[Value], values: &[Value], rereduce: bool) -> Result<Value> {
        match self {
            Self::Count if !rereduce => Ok(json!(values.len())),
            Self::Count | Self::Sum => {
                let mut total = 0.0;
                for v in values {
                    total += number(v, *self)?;
                }
                Ok(num_value(total))
            }
            Self::Stats => {
                let mut acc: Option<Stats> = None;
                for v in values {
                    let s = if rereduce {
                        Stats::from_value(v)?
                    } else {
                        Stats::of(number(v, *self)?)
                    };
                    acc = Some(match acc {
                        Some(a) => a.merge(s),
                        None => s,
                    });
                }
                Ok(acc.map(Stats::to_value).unwrap_or(Value::Null))
            }
        }
    }
}

/// 一个视图的可执行定义
#[derive(Clone)]
pub struct ViewDefinition {
    pub map: Arc<dyn MapFunction>,
    pub reduce: Option<Arc<dyn ReduceFunction>>,
    /// map 版本：变化即整个索引失效
    pub version: String,
}

impl ViewDefinition {
    pub fn new(map: Arc<dyn MapFunction>, version: impl Into<String>) -> Self {
        Self {
            map,
            reduce: None,
            version: version.into(),
        }
    }

    pub fn with_reduce(mut self, reduce: Arc<dyn ReduceFunction>) -> Self {
        self.reduce = Some(reduce);
        self
    }
}

impl fmt::Debug for ViewDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewDefinition")
            .field("version", &self.version)
            .field("reduce", &self.reduce.is_some())
            .finish()
    }
}

/// 版本变化且索引非空时的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InvalidationPolicy {
    #[default]
    Invalidate,
    Reject,
}

/// 某种语言的 map/reduce 编译器，注册在 Manager 的共享状态中
pub trait ViewCompiler: Send + Sync {
    fn language(&self) -> &str;

    fn compile_map(&self, source: &str) -> Result<Arc<dyn MapFunction>>;

    fn compile_reduce(&self, source: &str) -> Result<Arc<dyn ReduceFunction>> {
        BuiltinReduce::parse(source)
            .map(|r| Arc::new(r) as Arc<dyn ReduceFunction>)
            .ok_or_else(|| {
                ViewError::compile(self.language(), format!("unsupported reduce {:?}", source))
            })
    }
}

/// 源码 -> 定义；版本取 (语言, map, reduce) 的 xxh3
pub fn compile_definition(
    compiler: &dyn ViewCompiler,
    map_source: &str,
    reduce_source: Option<&str>,
) -> Result<ViewDefinition> {
    let map = compiler.compile_map(map_source)?;
    let reduce = reduce_source
        .map(|src| compiler.compile_reduce(src))
        .transpose()?;
    let mut h = Vec::with_capacity(map_source.len() + 32);
    h.extend_from_slice(compiler.language().as_bytes());
    h.push(0);
    h.extend_from_slice(map_source.as_bytes());
    h.push(0);
    if let Some(r) = reduce_source {
        h.extend_from_slice(r.as_bytes());
    }
    let version = format!("{:016x}", xxhash_rust::xxh3::xxh3_64(&h));
    Ok(ViewDefinition {
        map,
        reduce,
        version,
    })
}
