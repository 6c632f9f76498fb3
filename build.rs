fn main() {
    prost_build::Config::new()
        .compile_protos(&["proto/compile.proto"], &["proto"])
        .expect("failed to compile proto/compile.proto");
}
