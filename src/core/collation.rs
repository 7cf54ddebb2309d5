//! 索引 key 的排序规则（JSON 值之间的全序）。
//!
//! 类型次序固定：`null < false < true < number < string < array < object`；
//! 三种规则只在字符串比较（以及 Raw 的整体编码比较）上不同：
//! - `Unicode`：NFC 规范化后先忽略大小写比较，再以“小写在前”决胜，最后按码点
//! - `Ascii`：字符串按 UTF-8 字节序
//! - `Raw`：整个值按规范 JSON 编码的字节序比较（不分类型次序）
//!
//! 实现必须确定、反对称、可传递：存储层的 BTreeMap 依赖它。

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use unicode_normalization::UnicodeNormalization;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collation {
    #[default]
    Unicode,
    Raw,
    Ascii,
}

impl Collation {
    pub fn as_str(self) -> &'static str {
        match self {
            Collation::Unicode => "unicode",
            Collation::Raw => "raw",
            Collation::Ascii => "ascii",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "unicode" => Some(Collation::Unicode),
            "raw" => Some(Collation::Raw),
            "ascii" => Some(Collation::Ascii),
            _ => None,
        }
    }

    pub fn compare(self, a: &Value, b: &Value) -> Ordering {
        match self {
            Collation::Unicode => compare_json(a, b, unicode_cmp),
            Collation::Ascii => compare_json(a, b, ascii_cmp),
            Collation::Raw => raw_bytes(a).cmp(&raw_bytes(b)),
        }
    }

    pub fn keys_equal(self, a: &Value, b: &Value) -> bool {
        self.compare(a, b) == Ordering::Equal
    }
}

fn raw_bytes(v: &Value) -> Vec<u8> {
    // Map 默认按 key 排序，编码结果对同一逻辑值是稳定的
    serde_json::to_vec(v).unwrap_or_default()
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(false) => 1,
        Value::Bool(true) => 2,
        Value::Number(_) => 3,
        Value::String(_) => 4,
        Value::Array(_) => 5,
        Value::Object(_) => 6,
    }
}

fn compare_json(a: &Value, b: &Value, str_cmp: fn(&str, &str) -> Ordering) -> Ordering {
    let (ra, rb) = (type_rank(a), type_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.total_cmp(&y)
        }
        (Value::String(x), Value::String(y)) => str_cmp(x, y),
        (Value::Array(xs), Value::Array(ys)) => {
            for (x, y) in xs.iter().zip(ys.iter()) {
                let o = compare_json(x, y, str_cmp);
                if o != Ordering::Equal {
                    return o;
                }
            }
            xs.len().cmp(&ys.len())
        }
        (Value::Object(xs), Value::Object(ys)) => {
            for ((kx, vx), (ky, vy)) in xs.iter().zip(ys.iter()) {
                let o = str_cmp(kx, ky);
                if o != Ordering::Equal {
                    return o;
                }
                let o = compare_json(vx, vy, str_cmp);
                if o != Ordering::Equal {
                    return o;
                }
            }
            xs.len().cmp(&ys.len())
        }
        _ => Ordering::Equal,
    }
}

fn ascii_cmp(a: &str, b: &str) -> Ordering {
    a.as_bytes().cmp(b.as_bytes())
}

fn unicode_cmp(a: &str, b: &str) -> Ordering {
    if a == b {
        return Ordering::Equal;
    }
    let an: Vec<char> = a.nfc().collect();
    let bn: Vec<char> = b.nfc().collect();

    // 一级：忽略大小写
    let fold_a = an.iter().flat_map(|c| c.to_lowercase());
    let fold_b = bn.iter().flat_map(|c| c.to_lowercase());
    let primary = fold_a.cmp(fold_b);
    if primary != Ordering::Equal {
        return primary;
    }

    // 三级：同位置小写排在大写前
    for (ca, cb) in an.iter().zip(bn.iter()) {
        if ca != cb {
            let rank = |c: &char| u8::from(c.is_uppercase());
            let o = rank(ca).cmp(&rank(cb));
            if o != Ordering::Equal {
                return o;
            }
        }
    }

    an.cmp(&bn)
}
