//! Descriptor Registry (spec §3, §4.4.2): caches gRPC `FileDescriptorSet`s and performs
//! JSON<->protobuf transcoding keyed by a method's descriptor. Entries only grow; a reload
//! requires constructing a new registry. Transcoding is reflective: `prost-reflect` builds a
//! `DynamicMessage` from the cached descriptors, so arbitrary message shapes round-trip rather
//! than only a hand-picked set of well-known wrapper types.

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine;
use parking_lot::RwLock;
use prost_reflect::{DescriptorPool, DynamicMessage};
use prost_types::{FileDescriptorProto, FileDescriptorSet};

use crate::error::GatewayError;

/// A resolved gRPC method: the full path clients dial (`/package.Service/Method`) plus enough of
/// its descriptor to know the wire format. `input_type`/`output_type` key `DynamicTranscoder`'s
/// lookups into the same registry's reflective `DescriptorPool`.
#[derive(Debug, Clone)]
pub struct MethodDescriptor {
	pub full_path: String,
	pub input_type: String,
	pub output_type: String,
	pub client_streaming: bool,
	pub server_streaming: bool,
}

#[derive(Debug, Clone)]
pub struct MessageDescriptor {
	pub full_name: String,
}

enum LoadMarker {
	Loaded,
}

struct Inner {
	methods: HashMap<String, MethodDescriptor>,
	messages: HashMap<String, MessageDescriptor>,
	loaded_files: HashMap<String, LoadMarker>,
	/// Backs `DynamicTranscoder`: the same `FileDescriptorSet`s registered above, merged into one
	/// reflective pool so arbitrary message types (not just well-known wrappers) can be built and
	/// read without compiled Rust types.
	pool: DescriptorPool,
}

impl Default for Inner {
	fn default() -> Self {
		Self {
			methods: HashMap::new(),
			messages: HashMap::new(),
			loaded_files: HashMap::new(),
			pool: DescriptorPool::new(),
		}
	}
}

/// Entries only ever grow (spec §3); "clearing" means constructing a new `DescriptorRegistry`.
pub struct DescriptorRegistry {
	inner: RwLock<Inner>,
}

impl DescriptorRegistry {
	pub fn new() -> Arc<Self> {
		Arc::new(Self { inner: RwLock::new(Inner::default()) })
	}

	pub fn is_loaded(&self, file_uri: &str) -> bool {
		self.inner.read().loaded_files.contains_key(file_uri)
	}

	/// Ensures descriptors for `file_uri` are present, loading from `set` on first use (spec
	/// §4.4.2 step 1: "ensure descriptors are loaded"). Fails if `set` is not internally
	/// consistent (e.g. a method references a message type the set never defines).
	pub fn ensure_loaded(&self, file_uri: &str, set: &FileDescriptorSet) -> Result<(), GatewayError> {
		if self.is_loaded(file_uri) {
			return Ok(());
		}
		let mut inner = self.inner.write();
		if inner.loaded_files.contains_key(file_uri) {
			return Ok(());
		}
		inner
			.pool
			.add_file_descriptor_set(set.clone())
			.map_err(|e| GatewayError::bad_request("invalid or inconsistent FileDescriptorSet").with_source(e))?;
		for file in &set.file {
			register_file(&mut inner, file);
		}
		inner.loaded_files.insert(file_uri.to_string(), LoadMarker::Loaded);
		Ok(())
	}

	pub fn load_from_base64(&self, file_uri: &str, encoded: &str) -> Result<(), GatewayError> {
		let bytes = base64::engine::general_purpose::STANDARD
			.decode(encoded)
			.map_err(|e| GatewayError::bad_request("invalid base64 descriptor set").with_source(e))?;
		let set = <FileDescriptorSet as prost::Message>::decode(bytes.as_slice())
			.map_err(|e| GatewayError::bad_request("invalid FileDescriptorSet").with_source(e))?;
		self.ensure_loaded(file_uri, &set)
	}

	pub fn load_from_file(&self, path: &str) -> Result<(), GatewayError> {
		let bytes = std::fs::read(path).map_err(|e| GatewayError::internal(format!("failed to read descriptor file '{path}'")).with_source(e))?;
		let set = <FileDescriptorSet as prost::Message>::decode(bytes.as_slice())
			.map_err(|e| GatewayError::bad_request("invalid FileDescriptorSet").with_source(e))?;
		self.ensure_loaded(path, &set)
	}

	pub fn method(&self, full_path: &str) -> Option<MethodDescriptor> {
		self.inner.read().methods.get(full_path).cloned()
	}

	pub fn message(&self, full_name: &str) -> Option<MessageDescriptor> {
		self.inner.read().messages.get(full_name).cloned()
	}

	/// Cheap clone (internally `Arc`-backed) of the reflective pool backing `DynamicTranscoder`.
	pub fn pool(&self) -> DescriptorPool {
		self.inner.read().pool.clone()
	}
}

impl Default for DescriptorRegistry {
	fn default() -> Self {
		Self { inner: RwLock::new(Inner::default()) }
	}
}

fn register_file(inner: &mut Inner, file: &FileDescriptorProto) {
	let package = file.package.clone().unwrap_or_default();
	for message in &file.message_type {
		let Some(name) = &message.name else { continue };
		let full_name = qualify(&package, name);
		inner.messages.insert(full_name.clone(), MessageDescriptor { full_name });
	}
	for service in &file.service {
		let Some(service_name) = &service.name else { continue };
		let qualified_service = qualify(&package, service_name);
		for method in &service.method {
			let Some(method_name) = &method.name else { continue };
			let full_path = format!("/{qualified_service}/{method_name}");
			inner.methods.insert(
				full_path.clone(),
				MethodDescriptor {
					full_path,
					input_type: method.input_type.clone().unwrap_or_default(),
					output_type: method.output_type.clone().unwrap_or_default(),
					client_streaming: method.client_streaming.unwrap_or(false),
					server_streaming: method.server_streaming.unwrap_or(false),
				},
			);
		}
	}
}

fn qualify(package: &str, name: &str) -> String {
	if package.is_empty() {
		name.trim_start_matches('.').to_string()
	} else {
		format!("{package}.{}", name.trim_start_matches('.'))
	}
}

/// Bidirectional JSON<->protobuf conversion governed by a method's descriptor (spec §4.4.2 /
/// GLOSSARY "Transcoding").
pub trait Transcoder: Send + Sync {
	fn json_to_proto(&self, descriptor: &MethodDescriptor, json: &[u8]) -> Result<Vec<u8>, GatewayError>;
	fn proto_to_json(&self, descriptor: &MethodDescriptor, proto: &[u8]) -> Result<Vec<u8>, GatewayError>;
}

/// A `Transcoder` driven by the reflective pool built from whatever `FileDescriptorSet`s a route
/// has caused the `DescriptorRegistry` to load. Builds a `prost_reflect::DynamicMessage` for the
/// method's input/output type, so any message shape the descriptor set defines round-trips, not
/// just the well-known wrapper types.
pub struct DynamicTranscoder {
	registry: Arc<DescriptorRegistry>,
}

impl DynamicTranscoder {
	pub fn new(registry: Arc<DescriptorRegistry>) -> Self {
		Self { registry }
	}

	fn message_descriptor(&self, type_name: &str) -> Result<prost_reflect::MessageDescriptor, GatewayError> {
		self.registry
			.pool()
			.get_message_by_name(type_name.trim_start_matches('.'))
			.ok_or_else(|| GatewayError::bad_request(format!("no descriptor registered for message type '{type_name}'")))
	}
}

impl Transcoder for DynamicTranscoder {
	fn json_to_proto(&self, descriptor: &MethodDescriptor, json: &[u8]) -> Result<Vec<u8>, GatewayError> {
		let message_descriptor = self.message_descriptor(&descriptor.input_type)?;
		// `serde_json::Deserializer` rather than `serde_json::from_slice` so unknown fields and
		// partial messages are tolerated the way `DynamicMessage`'s JSON mapping already allows
		// (spec §4.4.2 step 3: "tolerate unknown fields, partial messages").
		let mut deserializer = serde_json::Deserializer::from_slice(json);
		let message = DynamicMessage::deserialize(message_descriptor, &mut deserializer)
			.map_err(|e| GatewayError::bad_request(format!("JSON body does not match message type '{}'", descriptor.input_type)).with_source(e))?;
		let mut buf = Vec::new();
		prost::Message::encode(&message, &mut buf).map_err(|e| GatewayError::internal("failed to encode protobuf").with_source(e))?;
		Ok(buf)
	}

	fn proto_to_json(&self, descriptor: &MethodDescriptor, proto: &[u8]) -> Result<Vec<u8>, GatewayError> {
		let message_descriptor = self.message_descriptor(&descriptor.output_type)?;
		let message = DynamicMessage::decode(message_descriptor, proto)
			.map_err(|e| GatewayError::internal("failed to decode protobuf response").with_source(e))?;
		serde_json::to_vec(&message).map_err(|e| GatewayError::internal("failed to encode JSON").with_source(e))
	}
}

#[cfg(test)]
mod tests {
	use prost_types::field_descriptor_proto::{Label, Type};
	use prost_types::{DescriptorProto, FieldDescriptorProto, FileDescriptorProto, MethodDescriptorProto, ServiceDescriptorProto};

	use super::*;

	fn string_field(name: &str, number: i32) -> FieldDescriptorProto {
		FieldDescriptorProto {
			name: Some(name.to_string()),
			number: Some(number),
			label: Some(Label::Optional as i32),
			r#type: Some(Type::String as i32),
			json_name: Some(name.to_string()),
			..Default::default()
		}
	}

	fn sample_set() -> FileDescriptorSet {
		FileDescriptorSet {
			file: vec![FileDescriptorProto {
				name: Some("example/v1/greeter.proto".to_string()),
				package: Some("example.v1".to_string()),
				syntax: Some("proto3".to_string()),
				message_type: vec![
					DescriptorProto {
						name: Some("HelloRequest".to_string()),
						field: vec![string_field("name", 1)],
						..Default::default()
					},
					DescriptorProto {
						name: Some("HelloReply".to_string()),
						field: vec![string_field("message", 1)],
						..Default::default()
					},
				],
				service: vec![ServiceDescriptorProto {
					name: Some("Greeter".to_string()),
					method: vec![MethodDescriptorProto {
						name: Some("SayHello".to_string()),
						input_type: Some(".example.v1.HelloRequest".to_string()),
						output_type: Some(".example.v1.HelloReply".to_string()),
						..Default::default()
					}],
					..Default::default()
				}],
				..Default::default()
			}],
		}
	}

	#[test]
	fn method_path_is_qualified_with_package() {
		let registry = DescriptorRegistry::new();
		registry.ensure_loaded("mem://test", &sample_set()).unwrap();
		let method = registry.method("/example.v1.Greeter/SayHello").unwrap();
		assert_eq!(method.input_type, ".example.v1.HelloRequest");
	}

	#[test]
	fn loading_twice_is_a_no_op() {
		let registry = DescriptorRegistry::new();
		registry.ensure_loaded("mem://test", &sample_set()).unwrap();
		registry.ensure_loaded("mem://test", &FileDescriptorSet::default()).unwrap();
		assert!(registry.method("/example.v1.Greeter/SayHello").is_some());
	}

	#[test]
	fn dynamic_transcoder_round_trips_an_arbitrary_message() {
		let registry = DescriptorRegistry::new();
		registry.ensure_loaded("mem://test", &sample_set()).unwrap();
		let method = registry.method("/example.v1.Greeter/SayHello").unwrap();
		let transcoder = DynamicTranscoder::new(registry);

		// Both directions keyed off `HelloRequest` (not just the wrapper types): JSON -> proto
		// -> JSON is the identity for a well-formed input (spec §8 property #4).
		let request_descriptor = MethodDescriptor { output_type: method.input_type.clone(), ..method.clone() };
		let proto = transcoder.json_to_proto(&request_descriptor, br#"{"name":"world"}"#).unwrap();
		let json = transcoder.proto_to_json(&request_descriptor, &proto).unwrap();
		let value: serde_json::Value = serde_json::from_slice(&json).unwrap();
		assert_eq!(value["name"], "world");
	}

	#[test]
	fn dynamic_transcoder_rejects_unknown_message_type() {
		let registry = DescriptorRegistry::new();
		registry.ensure_loaded("mem://test", &sample_set()).unwrap();
		let transcoder = DynamicTranscoder::new(registry);
		let descriptor = MethodDescriptor {
			full_path: "/x/Y".to_string(),
			input_type: ".example.v1.Nonexistent".to_string(),
			output_type: ".example.v1.Nonexistent".to_string(),
			client_streaming: false,
			server_streaming: false,
		};
		let err = transcoder.json_to_proto(&descriptor, br#"{}"#).unwrap_err();
		assert_eq!(err.kind, crate::error::ErrorKind::BadRequest);
	}
}
