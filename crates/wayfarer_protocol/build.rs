use std::env;
use std::path::PathBuf;

fn main() {
	// Supply a protoc binary when one is not already available on the system.
	// The vendored compiler produces identical output to a system protoc, so
	// this only affects whether the build can run, not what it generates.
	if env::var_os("PROTOC").is_none() {
		if let Ok(path) = protoc_bin_vendored::protoc_bin_path() {
			unsafe { env::set_var("PROTOC", path) };
		}
	}

	println!("cargo:rerun-if-changed=../../proto");
	println!("cargo:rerun-if-changed=../../proto/wayfarer.proto");

	let proto_dir = PathBuf::from("../../proto");
	let proto_file = proto_dir.join("wayfarer.proto");

	let out_dir = PathBuf::from(env::var_os("OUT_DIR").expect("OUT_DIR must be set by Cargo"));

	let protos = [proto_file];
	let includes = [proto_dir];

	let mut config = prost_build::Config::new();

	config.out_dir(out_dir);
	config.protoc_arg("--experimental_allow_proto3_optional");
	config.type_attribute(
		".wayfarer.v1.EventEnvelope.Event",
		"#[allow(clippy::large_enum_variant)]",
	);
	config.type_attribute(".wayfarer.v1.Envelope.Msg", "#[allow(clippy::large_enum_variant)]");

	config
		.compile_protos(&protos, &includes)
		.expect("failed to compile protobuf definitions with prost");
}
