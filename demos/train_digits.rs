//! Logs a (simulated) training run of a small convolutional digit classifier.
//!
//! The program below has the structure a Fluid training script builds for MNIST: two
//! conv/pool stages, a softmax classifier, cross-entropy loss, the backward pass, and Adam
//! updates. The metrics are made up. Point TensorBoard at `./logs` to look at the result.

use rand::prelude::*;
use rand_distr::Normal;

use paddleboard_writer as pbw;
use pbw::program::{OpDesc, Program, SourceAttr, VarDesc, VarType};

const BATCH_SIZE: u64 = 50;
const PASS_NUM: u64 = 3;
const BATCHES_PER_PASS: u64 = 120;

fn conv_pool(
    program: &mut Program,
    prefix: (usize, usize),
    input: &str,
    in_channels: i64,
    num_filters: i64,
    in_size: i64,
) -> String {
    let (conv, pool) = prefix;
    let conv_size = in_size - 4;
    let pool_size = conv_size / 2;
    let w = format!("conv2d_{}.w_0", conv);
    let b = format!("conv2d_{}.b_0", conv);
    let tmp = |i: usize| format!("conv2d_{}.tmp_{}", conv, i);
    let pooled = format!("pool2d_{}.tmp_0", pool);
    let act_shape = vec![-1, num_filters, conv_size, conv_size];

    program
        .global_block_mut()
        .add_var(VarDesc::parameter(&w, vec![num_filters, in_channels, 5, 5], VarType::Fp32))
        .add_var(VarDesc::parameter(&b, vec![num_filters], VarType::Fp32))
        .add_var(VarDesc::tensor(tmp(0), act_shape.clone(), VarType::Fp32))
        .add_var(VarDesc::tensor(tmp(1), act_shape.clone(), VarType::Fp32))
        .add_var(VarDesc::tensor(tmp(2), act_shape, VarType::Fp32))
        .add_var(VarDesc::tensor(
            &pooled,
            vec![-1, num_filters, pool_size, pool_size],
            VarType::Fp32,
        ))
        .append_op(
            OpDesc::new("conv2d")
                .input("Input", [input])
                .input("Filter", [w.as_str()])
                .output("Output", [tmp(0)])
                .attr("strides", SourceAttr::Ints(vec![1, 1]))
                .attr("paddings", SourceAttr::Ints(vec![0, 0]))
                .attr("dilations", SourceAttr::Ints(vec![1, 1]))
                .attr("groups", SourceAttr::Int(1))
                .attr("use_cudnn", SourceAttr::Boolean(true)),
        )
        .append_op(
            OpDesc::new("elementwise_add")
                .input("X", [tmp(0)])
                .input("Y", [b.as_str()])
                .output("Out", [tmp(1)])
                .attr("axis", SourceAttr::Int(1)),
        )
        .append_op(OpDesc::new("relu").input("X", [tmp(1)]).output("Out", [tmp(2)]))
        .append_op(
            OpDesc::new("pool2d")
                .input("X", [tmp(2)])
                .output("Out", [pooled.as_str()])
                .attr("pooling_type", SourceAttr::String("max".into()))
                .attr("ksize", SourceAttr::Ints(vec![2, 2]))
                .attr("strides", SourceAttr::Ints(vec![2, 2]))
                .attr("paddings", SourceAttr::Ints(vec![0, 0])),
        );
    pooled
}

fn declared_shape(program: &Program, name: &str) -> Vec<i64> {
    program
        .find_var(0, name)
        .and_then(|v| v.shape.clone())
        .unwrap_or_default()
}

/// Adds one `<op>_grad` op per differentiable forward op, in reverse order, then an Adam update
/// per parameter.
fn append_backward_and_adam(program: &mut Program, loss: &str, params: &[&str]) {
    let data_vars = ["pixel", "label"];
    let forward: Vec<OpDesc> = program.blocks()[0].ops.clone();

    let loss_grad = format!("{}@GRAD", loss);
    let block = program.global_block_mut();
    block
        .add_var(VarDesc::tensor(&loss_grad, vec![1], VarType::Fp32))
        .append_op(
            OpDesc::new("fill_constant")
                .output("Out", [loss_grad.as_str()])
                .attr("shape", SourceAttr::Ints(vec![1]))
                .attr("value", SourceAttr::Float(1.0))
                .attr("dtype", SourceAttr::Int(VarType::Fp32 as i32)),
        );

    for op in forward.iter().rev() {
        let out = match op.primary_output() {
            Some(out) => out.to_string(),
            None => continue,
        };
        let mut grad_op = OpDesc::new(format!("{}_grad", op.op_type));
        for (slot, args) in &op.inputs {
            grad_op = grad_op.input(slot.as_str(), args.iter().map(String::as_str));
        }
        grad_op = grad_op
            .input("Out", [out.as_str()])
            .input("Out@GRAD", [format!("{}@GRAD", out)]);
        for (slot, args) in &op.inputs {
            let grads: Vec<String> = args
                .iter()
                .filter(|a| !data_vars.contains(&a.as_str()))
                .map(|arg| {
                    let grad = format!("{}@GRAD", arg);
                    let shape = declared_shape(program, arg.as_str());
                    program
                        .global_block_mut()
                        .add_var(VarDesc::tensor(grad.as_str(), shape, VarType::Fp32));
                    grad
                })
                .collect();
            if !grads.is_empty() {
                grad_op = grad_op.output(format!("{}@GRAD", slot), grads);
            }
        }
        grad_op.attrs.extend(op.attrs.clone());
        program.global_block_mut().append_op(grad_op);
    }

    let block = program.global_block_mut();
    block
        .add_var(VarDesc::parameter("learning_rate_0", vec![1], VarType::Fp32))
        .add_var(VarDesc::parameter("beta1_pow_acc_0", vec![1], VarType::Fp32))
        .add_var(VarDesc::parameter("beta2_pow_acc_0", vec![1], VarType::Fp32));
    for param in params {
        let moment1 = format!("{}_moment1_0", param);
        let moment2 = format!("{}_moment2_0", param);
        let shape = block
            .var(param)
            .and_then(|v| v.shape.clone())
            .unwrap_or_default();
        block
            .add_var(VarDesc::parameter(&moment1, shape.clone(), VarType::Fp32))
            .add_var(VarDesc::parameter(&moment2, shape, VarType::Fp32))
            .append_op(
                OpDesc::new("adam")
                    .input("Param", [*param])
                    .input("Grad", [format!("{}@GRAD", param)])
                    .input("LearningRate", ["learning_rate_0"])
                    .input("Moment1", [moment1.as_str()])
                    .input("Moment2", [moment2.as_str()])
                    .input("Beta1Pow", ["beta1_pow_acc_0"])
                    .input("Beta2Pow", ["beta2_pow_acc_0"])
                    .output("ParamOut", [*param])
                    .output("Moment1Out", [moment1.as_str()])
                    .output("Moment2Out", [moment2.as_str()])
                    .attr("beta1", SourceAttr::Float(0.9))
                    .attr("beta2", SourceAttr::Float(0.999))
                    .attr("epsilon", SourceAttr::Float(1e-8)),
            );
    }
}

fn build_program() -> Program {
    let mut program = Program::new();
    program
        .global_block_mut()
        .add_var(VarDesc::tensor("pixel", vec![-1, 1, 28, 28], VarType::Fp32))
        .add_var(VarDesc::tensor("label", vec![-1, 1], VarType::Int64));

    let pool_1 = conv_pool(&mut program, (0, 0), "pixel", 1, 20, 28);
    let pool_2 = conv_pool(&mut program, (1, 1), &pool_1, 20, 50, 12);

    program
        .global_block_mut()
        .add_var(VarDesc::parameter("fc_0.w_0", vec![800, 10], VarType::Fp32))
        .add_var(VarDesc::parameter("fc_0.b_0", vec![10], VarType::Fp32))
        .add_var(VarDesc::tensor("fc_0.tmp_0", vec![-1, 10], VarType::Fp32))
        .add_var(VarDesc::tensor("fc_0.tmp_1", vec![-1, 10], VarType::Fp32))
        .add_var(VarDesc::tensor("fc_0.tmp_2", vec![-1, 10], VarType::Fp32))
        .add_var(VarDesc::tensor("cross_entropy_0.tmp_0", vec![-1, 1], VarType::Fp32))
        .add_var(VarDesc::tensor("mean_0.tmp_0", vec![1], VarType::Fp32))
        .append_op(
            OpDesc::new("mul")
                .input("X", [pool_2.as_str()])
                .input("Y", ["fc_0.w_0"])
                .output("Out", ["fc_0.tmp_0"])
                .attr("x_num_col_dims", SourceAttr::Int(1))
                .attr("y_num_col_dims", SourceAttr::Int(1)),
        )
        .append_op(
            OpDesc::new("elementwise_add")
                .input("X", ["fc_0.tmp_0"])
                .input("Y", ["fc_0.b_0"])
                .output("Out", ["fc_0.tmp_1"])
                .attr("axis", SourceAttr::Int(1)),
        )
        .append_op(
            OpDesc::new("softmax")
                .input("X", ["fc_0.tmp_1"])
                .output("Out", ["fc_0.tmp_2"]),
        )
        .append_op(
            OpDesc::new("cross_entropy")
                .input("X", ["fc_0.tmp_2"])
                .input("Label", ["label"])
                .output("Y", ["cross_entropy_0.tmp_0"])
                .attr("soft_label", SourceAttr::Boolean(false)),
        )
        .append_op(
            OpDesc::new("mean")
                .input("X", ["cross_entropy_0.tmp_0"])
                .output("Out", ["mean_0.tmp_0"]),
        );

    append_backward_and_adam(
        &mut program,
        "mean_0.tmp_0",
        &[
            "conv2d_0.w_0",
            "conv2d_0.b_0",
            "conv2d_1.w_0",
            "conv2d_1.b_0",
            "fc_0.w_0",
            "fc_0.b_0",
        ],
    );

    // The accuracy evaluator reads the prediction after the optimizer step.
    program
        .global_block_mut()
        .add_var(VarDesc::tensor("top_k_0.tmp_0", vec![-1, 1], VarType::Fp32))
        .add_var(VarDesc::tensor("top_k_0.tmp_1", vec![-1, 1], VarType::Int64))
        .add_var(VarDesc::tensor("accuracy_0.tmp_0", vec![1], VarType::Fp32))
        .add_var(VarDesc::tensor("accuracy_0.tmp_1", vec![1], VarType::Int32))
        .add_var(VarDesc::tensor("accuracy_0.tmp_2", vec![1], VarType::Int32))
        .append_op(
            OpDesc::new("top_k")
                .input("X", ["fc_0.tmp_2"])
                .output("Out", ["top_k_0.tmp_0"])
                .output("Indices", ["top_k_0.tmp_1"])
                .attr("k", SourceAttr::Int(1)),
        )
        .append_op(
            OpDesc::new("accuracy")
                .input("Out", ["top_k_0.tmp_0"])
                .input("Indices", ["top_k_0.tmp_1"])
                .input("Label", ["label"])
                .output("Accuracy", ["accuracy_0.tmp_0"])
                .output("Correct", ["accuracy_0.tmp_1"])
                .output("Total", ["accuracy_0.tmp_2"]),
        );
    program
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut train_fw = pbw::FileWriter::new(pbw::run_dir("./logs", "train"))?;

    let program = build_program();
    let graph = pbw::convert(&program)?;
    train_fw.write_graph(&graph)?;
    log::info!(
        "wrote graph with {} nodes for {} ops",
        graph.len(),
        program.op_count()
    );

    let mut rng = rand::thread_rng();
    let noise = Normal::new(0.0f32, 0.05)?;
    let mut best_accuracy = 0.0f32;
    // One step counter for the whole run, so passes line up end to end on the plots.
    let mut batch_id = 0u64;
    for pass_id in 0..PASS_NUM {
        let mut correct = 0.0f32;
        for _ in 0..BATCHES_PER_PASS {
            let progress = batch_id as f32 / (PASS_NUM * BATCHES_PER_PASS) as f32;
            let cost = (2.3 * (-4.0 * progress).exp() + noise.sample(&mut rng)).max(0.01);
            let accuracy = (0.1 + 0.88 * (1.0 - (-5.0 * progress).exp()) + noise.sample(&mut rng))
                .clamp(0.0, 1.0);
            correct += accuracy * BATCH_SIZE as f32;
            best_accuracy = best_accuracy.max(accuracy);

            train_fw.write("cost", cost, batch_id)?;
            train_fw.write("error", 1.0 - accuracy, batch_id)?;
            train_fw.write("accuracy", accuracy, batch_id)?;
            train_fw.write("best_accuracy", best_accuracy, batch_id)?;
            batch_id += 1;
        }
        let pass_acc = correct / (BATCHES_PER_PASS * BATCH_SIZE) as f32;
        log::info!("pass_id={} pass_acc={:.4}", pass_id, pass_acc);
    }

    let log_path = train_fw.log_path().map(|p| p.display().to_string());
    train_fw.close()?;
    println!(
        "wrote {} batches to {}",
        batch_id,
        log_path.unwrap_or_default()
    );
    Ok(())
}
