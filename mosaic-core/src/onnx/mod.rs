//! Generator and decoder backends evaluated from exported ONNX graphs.
//!
//! The graphs own the model internals; this module only maps the sampling
//! contract onto their named inputs and outputs. `candle-onnx` materializes
//! initializers on the CPU, so graph inputs are evaluated there too.

use std::collections::{HashMap, HashSet};

use anyhow::{anyhow, bail, Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_onnx::onnx::ModelProto;
use tracing::warn;

use crate::{Decoder, Generator, Loader, ModelFiles, PromptTensors, SamplingParams};

const GENERATOR_GRAPH: &str = "generator.onnx";
const DECODER_GRAPH: &str = "decoder.onnx";

struct Graph {
    model: ModelProto,
    inputs: HashSet<String>,
    output: String,
}

impl Graph {
    fn read(path: &std::path::Path) -> Result<Self> {
        let model = candle_onnx::read_file(path)
            .with_context(|| format!("failed to read ONNX graph {}", path.display()))?;
        Self::from_model(model).with_context(|| format!("invalid ONNX graph {}", path.display()))
    }

    fn from_model(model: ModelProto) -> Result<Self> {
        let graph = model
            .graph
            .as_ref()
            .ok_or_else(|| anyhow!("model defines no graph"))?;
        let inputs = graph.input.iter().map(|i| i.name.clone()).collect();
        let output = graph
            .output
            .first()
            .map(|o| o.name.clone())
            .ok_or_else(|| anyhow!("graph defines no outputs"))?;
        Ok(Self {
            model,
            inputs,
            output,
        })
    }

    fn first_input(&self) -> Option<&str> {
        self.model
            .graph
            .as_ref()
            .and_then(|g| g.input.first())
            .map(|i| i.name.as_str())
    }

    fn accepts(&self, name: &str) -> bool {
        self.inputs.contains(name)
    }

    fn run(&self, inputs: HashMap<String, Tensor>) -> Result<Tensor> {
        let mut outputs = candle_onnx::simple_eval(&self.model, inputs)?;
        outputs
            .remove(&self.output)
            .ok_or_else(|| anyhow!("graph did not produce `{}`", self.output))
    }
}

fn scalar_i64(value: i64) -> Result<Tensor> {
    Ok(Tensor::new(&[value], &Device::Cpu)?)
}

fn scalar_f32(value: f64) -> Result<Tensor> {
    Ok(Tensor::new(&[value as f32], &Device::Cpu)?)
}

fn on_cpu(t: &Tensor) -> Result<Tensor> {
    Ok(t.to_device(&Device::Cpu)?.to_dtype(DType::I64)?)
}

pub struct OnnxGenerator {
    graph: Graph,
}

impl OnnxGenerator {
    fn new(graph: Graph) -> Result<Self> {
        for required in ["input_ids", "seed"] {
            if !graph.accepts(required) {
                bail!("generator graph has no `{required}` input");
            }
        }
        Ok(Self { graph })
    }

    /// Named graph inputs for one call. Hyperparameters the graph does not
    /// declare are left out.
    fn inputs(
        &self,
        prompt: &PromptTensors,
        seed: u64,
        params: &SamplingParams,
    ) -> Result<HashMap<String, Tensor>> {
        let mut inputs = HashMap::new();
        inputs.insert("input_ids".to_string(), on_cpu(&prompt.input_ids)?);
        if self.graph.accepts("attention_mask") {
            inputs.insert("attention_mask".to_string(), on_cpu(&prompt.attention_mask)?);
        }
        inputs.insert("seed".to_string(), scalar_i64(seed as i64)?);

        let optional = [
            ("top_k", params.top_k.map(|k| scalar_i64(k as i64))),
            ("top_p", params.top_p.map(scalar_f32)),
            ("temperature", params.temperature.map(scalar_f32)),
            ("condition_scale", Some(scalar_f32(params.condition_scale))),
        ];
        for (name, value) in optional {
            let Some(value) = value else { continue };
            if self.graph.accepts(name) {
                inputs.insert(name.to_string(), value?);
            } else {
                warn!(input = name, "generator graph ignores hyperparameter");
            }
        }
        Ok(inputs)
    }
}

impl Generator for OnnxGenerator {
    fn generate(
        &self,
        prompt: &PromptTensors,
        seed: u64,
        params: &SamplingParams,
    ) -> Result<Tensor> {
        let tokens = self.graph.run(self.inputs(prompt, seed, params)?)?;
        Ok(tokens.to_dtype(DType::U32)?)
    }
}

pub struct OnnxGeneratorLoader;

impl Loader for OnnxGeneratorLoader {
    type Model = OnnxGenerator;

    const FILES: &'static [&'static str] = &[GENERATOR_GRAPH];

    fn load(files: &ModelFiles, _dtype: DType, _device: &Device) -> Result<Self::Model> {
        OnnxGenerator::new(Graph::read(files.get(GENERATOR_GRAPH)?)?)
    }
}

pub struct OnnxDecoder {
    graph: Graph,
    input: String,
}

impl OnnxDecoder {
    fn new(graph: Graph) -> Result<Self> {
        let input = graph
            .first_input()
            .ok_or_else(|| anyhow!("decoder graph has no inputs"))?
            .to_string();
        Ok(Self { graph, input })
    }
}

impl Decoder for OnnxDecoder {
    fn decode(&self, tokens: &Tensor) -> Result<Tensor> {
        let mut inputs = HashMap::new();
        inputs.insert(self.input.clone(), on_cpu(tokens)?);
        let pixels = self.graph.run(inputs)?;
        // Channel-first graphs are turned channel-last.
        if matches!(pixels.dims(), [_, 3, _, _]) {
            Ok(pixels.permute((0, 2, 3, 1))?)
        } else {
            Ok(pixels)
        }
    }
}

pub struct OnnxDecoderLoader;

impl Loader for OnnxDecoderLoader {
    type Model = OnnxDecoder;

    const FILES: &'static [&'static str] = &[DECODER_GRAPH];

    fn load(files: &ModelFiles, _dtype: DType, _device: &Device) -> Result<Self::Model> {
        OnnxDecoder::new(Graph::read(files.get(DECODER_GRAPH)?)?)
    }
}

#[cfg(test)]
mod tests {
    use candle_onnx::onnx::{GraphProto, NodeProto, ValueInfoProto};

    use super::*;

    fn value(name: &str) -> ValueInfoProto {
        ValueInfoProto {
            name: name.to_string(),
            doc_string: String::new(),
            r#type: None,
        }
    }

    /// A graph forwarding its first input to `out` unchanged.
    fn identity(inputs: &[&str]) -> Graph {
        let model = ModelProto {
            metadata_props: vec![],
            training_info: vec![],
            functions: vec![],
            ir_version: 0,
            opset_import: vec![],
            producer_name: String::new(),
            producer_version: String::new(),
            domain: String::new(),
            model_version: 0,
            doc_string: String::new(),
            graph: Some(GraphProto {
                node: vec![NodeProto {
                    op_type: "Identity".to_string(),
                    domain: String::new(),
                    attribute: vec![],
                    input: vec![inputs[0].to_string()],
                    output: vec!["out".to_string()],
                    name: String::new(),
                    doc_string: String::new(),
                }],
                name: String::new(),
                initializer: vec![],
                input: inputs.iter().map(|name| value(name)).collect(),
                output: vec![value("out")],
                value_info: vec![],
                doc_string: String::new(),
                sparse_initializer: vec![],
                quantization_annotation: vec![],
            }),
        };
        Graph::from_model(model).unwrap()
    }

    fn prompt() -> PromptTensors {
        PromptTensors {
            input_ids: Tensor::new(&[[5u32, 6, 0]], &Device::Cpu).unwrap(),
            attention_mask: Tensor::new(&[[1u32, 1, 0]], &Device::Cpu).unwrap(),
        }
    }

    #[test]
    fn generator_feeds_only_declared_inputs() {
        let generator = OnnxGenerator::new(identity(&["input_ids", "seed", "top_k"])).unwrap();
        let params = SamplingParams {
            top_k: Some(50),
            temperature: Some(0.7),
            ..SamplingParams::default()
        };
        let inputs = generator.inputs(&prompt(), 9, &params).unwrap();
        let mut names: Vec<&str> = inputs.keys().map(String::as_str).collect();
        names.sort_unstable();
        assert_eq!(names, vec!["input_ids", "seed", "top_k"]);
        assert_eq!(inputs["seed"].to_vec1::<i64>().unwrap(), vec![9]);
        assert_eq!(inputs["input_ids"].dtype(), DType::I64);
    }

    #[test]
    fn generator_output_is_u32() {
        let generator = OnnxGenerator::new(identity(&["input_ids", "seed"])).unwrap();
        let tokens = generator
            .generate(&prompt(), 1, &SamplingParams::default())
            .unwrap();
        assert_eq!(tokens.dtype(), DType::U32);
        assert_eq!(tokens.to_vec2::<u32>().unwrap(), vec![vec![5, 6, 0]]);
    }

    #[test]
    fn generator_requires_a_seed_input() {
        assert!(OnnxGenerator::new(identity(&["input_ids"])).is_err());
    }

    #[test]
    fn channel_first_decoder_output_is_made_channel_last() {
        let decoder = OnnxDecoder::new(identity(&["pixels"])).unwrap();
        let nchw = Tensor::arange(0i64, 12, &Device::Cpu)
            .unwrap()
            .reshape((1, 3, 2, 2))
            .unwrap();
        let nhwc = decoder.decode(&nchw).unwrap();
        assert_eq!(nhwc.dims(), &[1, 2, 2, 3]);
        let first_pixel = nhwc.flatten_all().unwrap().to_vec1::<i64>().unwrap();
        assert_eq!(&first_pixel[..3], &[0, 4, 8]);
    }
}
