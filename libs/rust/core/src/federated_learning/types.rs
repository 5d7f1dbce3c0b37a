//! Shared round data model: instructions sent to participants and what they report back.

use std::collections::BTreeMap;
use std::fmt;
use serde::{Deserialize, Serialize};

/// 1-based round counter supplied by the orchestrator.
pub type RoundIndex = u64;
pub type ParticipantId = String;

/// Metric name -> value. Ordered so text renderings and JSON dumps are stable.
pub type Metrics = BTreeMap<String, f64>;

/// Per-round instruction payload, identical for every participant of a round.
pub type RoundConfig = BTreeMap<String, Scalar>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Scalar {
    pub fn as_f64(&self) -> Option<f64> {
        match self { Scalar::Int(v) => Some(*v as f64), Scalar::Float(v) => Some(*v), _ => None }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self { Scalar::Int(v) => Some(*v), _ => None }
    }
}

impl From<bool> for Scalar { fn from(v: bool) -> Self { Scalar::Bool(v) } }
impl From<i64> for Scalar { fn from(v: i64) -> Self { Scalar::Int(v) } }
impl From<u32> for Scalar { fn from(v: u32) -> Self { Scalar::Int(v as i64) } }
impl From<f64> for Scalar { fn from(v: f64) -> Self { Scalar::Float(v) } }
impl From<&str> for Scalar { fn from(v: &str) -> Self { Scalar::Str(v.to_string()) } }
impl From<String> for Scalar { fn from(v: String) -> Self { Scalar::Str(v) } }

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Bool(v) => write!(f, "{v}"),
            Scalar::Int(v) => write!(f, "{v}"),
            Scalar::Float(v) => write!(f, "{v}"),
            Scalar::Str(v) => write!(f, "{v:?}"),
        }
    }
}

/// Opaque model state exchanged with participants: layers -> flat weights.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Parameters {
    pub tensors: Vec<Vec<f32>>,
}

impl Parameters {
    pub fn new(tensors: Vec<Vec<f32>>) -> Self { Self { tensors } }
    pub fn is_empty(&self) -> bool { self.tensors.is_empty() }
    pub fn shape(&self) -> Vec<usize> { self.tensors.iter().map(Vec::len).collect() }
}

/// One participant's contribution to a round's metric stream.
///
/// `sample_count` must be positive; the aggregator weights by it and does not
/// filter zero-sample entries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParticipantResult {
    pub sample_count: u64,
    pub metrics: Metrics,
}

impl ParticipantResult {
    pub fn new(sample_count: u64, metrics: Metrics) -> Self { Self { sample_count, metrics } }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FitIns {
    pub round: RoundIndex,
    pub parameters: Parameters,
    pub config: RoundConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FitRes {
    pub parameters: Parameters,
    pub sample_count: u64,
    #[serde(default)]
    pub metrics: Metrics,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvaluateIns {
    pub round: RoundIndex,
    pub parameters: Parameters,
    pub config: RoundConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvaluateRes {
    pub loss: f64,
    pub sample_count: u64,
    #[serde(default)]
    pub metrics: Metrics,
}

impl From<&FitRes> for ParticipantResult {
    fn from(res: &FitRes) -> Self { ParticipantResult::new(res.sample_count, res.metrics.clone()) }
}

impl From<&EvaluateRes> for ParticipantResult {
    fn from(res: &EvaluateRes) -> Self { ParticipantResult::new(res.sample_count, res.metrics.clone()) }
}

/// Score of the global state against the coordinator-held test set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CentralizedEvalResult {
    #[serde(with = "float_repr")]
    pub loss: f64,
    #[serde(with = "float_repr::metrics")]
    pub metrics: Metrics,
}

/// JSON has no NaN or infinity; those are written as the strings `"NaN"`, `"inf"`, `"-inf"`.
pub(crate) mod float_repr {
    use std::collections::BTreeMap;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Num(f64),
        Tag(String),
    }

    impl From<f64> for Repr {
        fn from(v: f64) -> Self {
            if v.is_finite() { return Repr::Num(v); }
            let tag = if v.is_nan() { "NaN" } else if v > 0.0 { "inf" } else { "-inf" };
            Repr::Tag(tag.into())
        }
    }

    impl Repr {
        fn into_f64<E: serde::de::Error>(self) -> Result<f64, E> {
            match self {
                Repr::Num(v) => Ok(v),
                Repr::Tag(tag) => match tag.as_str() {
                    "NaN" => Ok(f64::NAN),
                    "inf" => Ok(f64::INFINITY),
                    "-inf" => Ok(f64::NEG_INFINITY),
                    other => Err(E::custom(format!("expected a number, \"NaN\", \"inf\" or \"-inf\", got {other:?}"))),
                },
            }
        }
    }

    pub fn serialize<S: Serializer>(v: &f64, s: S) -> Result<S::Ok, S::Error> { Repr::from(*v).serialize(s) }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> { Repr::deserialize(d)?.into_f64() }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(v: &Option<f64>, s: S) -> Result<S::Ok, S::Error> { v.map(Repr::from).serialize(s) }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
            Option::<Repr>::deserialize(d)?.map(Repr::into_f64).transpose()
        }
    }

    pub mod metrics {
        use super::*;
        use crate::federated_learning::types::Metrics;

        fn encode(m: &Metrics) -> BTreeMap<&str, Repr> { m.iter().map(|(k, v)| (k.as_str(), Repr::from(*v))).collect() }

        fn decode<E: serde::de::Error>(m: BTreeMap<String, Repr>) -> Result<Metrics, E> {
            m.into_iter().map(|(k, v)| Ok((k, v.into_f64()?))).collect()
        }

        pub fn serialize<S: Serializer>(m: &Metrics, s: S) -> Result<S::Ok, S::Error> { encode(m).serialize(s) }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Metrics, D::Error> { decode(BTreeMap::deserialize(d)?) }

        pub mod option {
            use super::*;

            pub fn serialize<S: Serializer>(m: &Option<Metrics>, s: S) -> Result<S::Ok, S::Error> { m.as_ref().map(encode).serialize(s) }

            pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Metrics>, D::Error> {
                Option::<BTreeMap<String, Repr>>::deserialize(d)?.map(decode).transpose()
            }
        }
    }
}
