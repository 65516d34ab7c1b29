use tonic_build::manual::{Builder, Method, Service};

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=src/grpc/proto.rs");

    // Messages are hand-written prost types in src/grpc/proto.rs, so only the
    // service glue is generated here and no protoc is needed.
    let admission = Service::builder()
        .name("Admission")
        .package("tollgate.admission.v1")
        .comment("Admission control for guarded operations.")
        .method(
            Method::builder()
                .name("check")
                .route_name("Check")
                .comment("Count one request and decide whether it may proceed.")
                .input_type("crate::grpc::proto::CheckRequest")
                .output_type("crate::grpc::proto::CheckResponse")
                .codec_path("tonic::codec::ProstCodec")
                .build(),
        )
        .build();

    Builder::new()
        .build_client(false)
        .build_server(true)
        .compile(&[admission]);
}
