use vergen::EmitBuilder;

fn main() {
    // 生成构建信息；不在 git 仓库中构建时只缺少 git 信息
    if let Err(e) = EmitBuilder::builder().all_build().all_git().emit() {
        println!("cargo:warning=无法生成构建信息: {}", e);
    }
}
