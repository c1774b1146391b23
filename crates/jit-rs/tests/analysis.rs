use dyna_core::Variable;
use dyna_jit::backend::CompileUnit;
use dyna_jit::{
    Backend, CompileOptions, CompiledFn, Integrator, Interpreter, Jit, JitError, JitSettings,
    Member, NativeFn, NodeId, ObjectGraph, RuntimeValue,
};
use ndarray::arr1;

fn jit() -> Jit<Interpreter> {
    Jit::new(Interpreter, JitSettings::default()).unwrap()
}

fn float(value: &RuntimeValue) -> f64 {
    value.as_f64().unwrap()
}

/// `net.sub -> syn`, `syn.owner -> net` (a cycle)
fn network() -> (ObjectGraph, NodeId, NodeId) {
    let mut graph = ObjectGraph::new();
    let net = graph.add_node("net").unwrap();
    let syn = graph.add_node("syn").unwrap();
    graph.add_child(net, "sub", syn).unwrap();
    graph.add_child(syn, "owner", net).unwrap();
    graph
        .add_state(syn, "w", Variable::from_vec("w", vec![1.0, 2.0, 3.0]))
        .unwrap();
    graph
        .add_state(net, "V", Variable::from_vec("V", vec![0.0, 0.0, 0.0]))
        .unwrap();
    graph.add_constant(net, "tau", 2.0).unwrap();
    (graph, net, syn)
}

const SUM_W: &str = "
@jit
def f(self, scale) {
    total = 0.0
    for i in range(len(self.sub.w.value)) {
        total += self.sub.w.value[i] * scale
    }
    return total
}";

#[test]
fn test_loop_over_child_state_matches_uncompiled() {
    let (mut graph, net, _) = network();
    graph.add_method(net, "f", SUM_W).unwrap();

    let expected = Interpreter::with_graph(&graph)
        .call_method(net, "f", vec![RuntimeValue::Float(2.0)], vec![])
        .unwrap();
    assert_eq!(float(&expected), 12.0);

    let mut jit = jit();
    let result = jit.analyze(&graph, net, "f").unwrap();
    assert_eq!(
        result.hoisted_arguments.iter().collect::<Vec<_>>(),
        vec!["syn_w"]
    );
    assert_eq!(result.argument_to_source_expression["syn_w"], "syn.w.value");
    assert_eq!(result.function.params(), ["scale", "syn_w"]);

    let source = result.source.clone().unwrap();
    assert!(source.starts_with("def f(scale, syn_w=None) {"));
    assert!(!source.contains("self"));
    assert!(!source.contains('@'));

    // explicit injection and graph-supplied state agree with the uncompiled call
    let w = RuntimeValue::array(arr1(&[1.0, 2.0, 3.0]).into_dyn());
    let injected = result
        .function
        .call(vec![RuntimeValue::Float(2.0)], vec![("syn_w".to_string(), w)])
        .unwrap();
    assert_eq!(float(&injected), float(&expected));
    let supplied = result
        .invoke(&graph, vec![RuntimeValue::Float(2.0)], vec![])
        .unwrap();
    assert_eq!(float(&supplied), float(&expected));
}

#[test]
fn test_writes_reach_state() {
    let source = "def update(self, dt) {
        self.V.value += dt * self.sub.w.value / self.tau
        self.V.value[0] = -1.0
    }";

    let (mut direct, net, _) = network();
    direct.add_method(net, "update", source).unwrap();
    Interpreter::with_graph(&direct)
        .call_method(net, "update", vec![RuntimeValue::Float(0.5)], vec![])
        .unwrap();

    let (mut compiled, net2, _) = network();
    compiled.add_method(net2, "update", source).unwrap();
    let mut jit = jit();
    let result = jit.analyze(&compiled, net2, "update").unwrap();
    assert!(result.source.as_ref().unwrap().contains("net_V[0] = -1.0"));
    result
        .invoke(&compiled, vec![RuntimeValue::Float(0.5)], vec![])
        .unwrap();

    let expected = arr1(&[-1.0, 0.5, 0.75]).into_dyn();
    assert_eq!(direct.state(net, "V").unwrap().snapshot(), expected);
    assert_eq!(compiled.state(net2, "V").unwrap().snapshot(), expected);
}

#[test]
fn test_plain_assignment_to_hoisted_state_writes_in_place() {
    let (mut graph, net, _) = network();
    graph
        .add_method(net, "reset", "def reset(self) { self.V.value = 7.0 }")
        .unwrap();
    let result = jit().analyze(&graph, net, "reset").unwrap();
    result.invoke(&graph, vec![], vec![]).unwrap();
    assert_eq!(
        graph.state(net, "V").unwrap().snapshot(),
        arr1(&[7.0, 7.0, 7.0]).into_dyn()
    );
}

#[test]
fn test_nested_method_call_is_rewritten() {
    let (mut graph, net, syn) = network();
    graph
        .add_method(syn, "g", "def g(self, x) { return x * sum(self.w.value) }")
        .unwrap();
    graph
        .add_method(net, "f", "def f(self, x) { return self.sub.g(x) + self.tau }")
        .unwrap();

    let mut jit = jit();
    let result = jit.analyze(&graph, net, "f").unwrap();
    assert!(result.hoisted_arguments.contains("syn_w"));
    let source = result.source.clone().unwrap();
    assert!(source.contains("syn_g(x, syn_w=syn_w) + net_tau"), "{source}");

    let value = result
        .invoke(&graph, vec![RuntimeValue::Float(2.0)], vec![])
        .unwrap();
    let expected = Interpreter::with_graph(&graph)
        .call_method(net, "f", vec![RuntimeValue::Float(2.0)], vec![])
        .unwrap();
    assert_eq!(float(&value), 14.0);
    assert_eq!(float(&value), float(&expected));
}

#[test]
fn test_cycle_paths_share_one_argument() {
    let (mut graph, net, syn) = network();
    graph
        .add_method(
            net,
            "f",
            "def f(self) { return self.sub.owner.V.value + self.V.value + self.sub.owner.sub.w.value }",
        )
        .unwrap();
    let result = jit().analyze(&graph, net, "f").unwrap();
    assert_eq!(
        result.hoisted_arguments.iter().collect::<Vec<_>>(),
        vec!["net_V", "syn_w"]
    );
    assert_eq!(result.visited_objects["self.sub"], syn);
    assert_eq!(result.visited_objects["self.sub.owner"], net);
}

#[test]
fn test_analysis_is_idempotent() {
    let (mut graph, net, _) = network();
    graph.add_method(net, "f", SUM_W).unwrap();
    let mut jit = jit();
    let first = jit.analyze(&graph, net, "f").unwrap();
    jit.clear_cache();
    let second = jit.analyze(&graph, net, "f").unwrap();
    assert_eq!(first.hoisted_arguments, second.hoisted_arguments);
    assert_eq!(first.source, second.source);
    assert!(!first.function.ptr_eq(&second.function));

    // cached results are returned as they are
    let third = jit.analyze(&graph, net, "f").unwrap();
    assert!(third.function.ptr_eq(&second.function));
    jit.invalidate(net);
    let fourth = jit.analyze(&graph, net, "f").unwrap();
    assert!(!fourth.function.ptr_eq(&second.function));
}

#[test]
fn test_variadic_call_site_fails() {
    let (mut graph, net, _) = network();
    graph
        .add_method(net, "g", "def g(self, x) { return x + self.V.value }")
        .unwrap();
    graph
        .add_method(net, "f", "def f(self, args) { return self.g(*args) }")
        .unwrap();
    let err = jit().analyze(&graph, net, "f").unwrap_err();
    assert!(matches!(err, JitError::UnsupportedCallSite { .. }));
    assert!(err.to_string().contains("self.g(*args)"));
}

#[test]
fn test_recursive_methods_fail() {
    let (mut graph, net, _) = network();
    graph.add_method(net, "a", "def a(self) { return self.b() }").unwrap();
    graph.add_method(net, "b", "def b(self) { return self.a() }").unwrap();
    let err = jit().analyze(&graph, net, "a").unwrap_err();
    assert!(matches!(err, JitError::RecursiveCall { ref chain } if chain == "net.a"));
}

#[test]
fn test_analysis_errors_name_the_culprit() {
    let (mut graph, net, _) = network();
    graph.add_method(net, "a", "def a(this) { return this.V.value }").unwrap();
    graph.add_method(net, "b", "def b(self) { return self.sub.nope }").unwrap();
    graph.add_method(net, "c", "def c(self) { return g(self.sub) }").unwrap();
    graph
        .add_method(net, "d", "def d(self) { net_V = 1.0 \n return self.V.value }")
        .unwrap();
    let mut jit = jit();

    let err = jit.analyze(&graph, net, "a").unwrap_err();
    assert!(matches!(err, JitError::UnrecognizedOwner { .. }));
    assert!(err.to_string().contains("this"));

    let err = jit.analyze(&graph, net, "b").unwrap_err();
    assert!(err.to_string().contains("self.sub.nope"));

    let err = jit.analyze(&graph, net, "c").unwrap_err();
    assert!(matches!(err, JitError::ChainResolvesToObject { ref chain } if chain == "self.sub"));

    let err = jit.analyze(&graph, net, "d").unwrap_err();
    assert!(matches!(err, JitError::NameCollision { ref name, .. } if name == "net_V"));
}

#[test]
fn test_random_stream_is_bound_in_scope() {
    let (mut graph, net, _) = network();
    graph
        .insert(net, "rng", Member::Random(dyna_jit::random::RandomState::new(3)))
        .unwrap();
    graph
        .add_method(net, "noise", "def noise(self) { return self.rng.normal(0.0, 1.0, size=3) }")
        .unwrap();
    let result = jit().analyze(&graph, net, "noise").unwrap();
    assert!(result.hoisted_arguments.is_empty());
    assert!(result.source.as_ref().unwrap().contains("net_rng.normal(0.0, 1.0, size=3)"));
    let value = result.invoke(&graph, vec![], vec![]).unwrap();
    assert_eq!(value.to_array().unwrap().shape(), [3]);
}

#[test]
fn test_method_without_state_is_not_rewritten() {
    let (mut graph, net, _) = network();
    graph
        .add_method(net, "sq", "def sq(self, x) { return x * x }")
        .unwrap();
    let result = jit().analyze(&graph, net, "sq").unwrap();
    assert!(result.source.is_none());
    let value = result.function.call(vec![RuntimeValue::Int(3)], vec![]).unwrap();
    assert_eq!(value.as_i64(), Some(9));
}

fn integrating_graph() -> (ObjectGraph, NodeId) {
    let mut graph = ObjectGraph::new();
    let net = graph.add_node("net").unwrap();
    graph
        .add_state(net, "V", Variable::from_vec("V", vec![1.0, 2.0]))
        .unwrap();
    graph
        .add_state(net, "I", Variable::from_vec("I", vec![0.5, 0.5]))
        .unwrap();
    graph.add_constant(net, "tau", 2.0).unwrap();
    graph
        .add_method(net, "dV", "def dV(self, V, t) { return (-V + self.I.value) / self.tau }")
        .unwrap();
    graph
        .insert(net, "int_V", Member::Integrator(Integrator::euler("V", "dV").unwrap()))
        .unwrap();
    graph
        .add_method(
            net,
            "update",
            "def update(self, t) { self.V.value = self.int_V(self.V.value, t) }",
        )
        .unwrap();
    (graph, net)
}

#[test]
fn test_integrator_is_recompiled_from_its_metadata() {
    let (graph, net) = integrating_graph();
    let mut jit = jit();
    let result = jit.analyze(&graph, net, "int_V").unwrap();
    assert!(result.hoisted_arguments.contains("net_I"));
    let source = result.source.clone().unwrap();
    assert!(source.contains("f(V, t, net_I=net_I)"), "{source}");
    assert!(!source.contains("self"));

    let meta = result.function.meta().unwrap();
    assert!(meta.is_compiled());
    assert!(!meta.bound);
    assert_eq!(meta.code, source);
    assert!(meta.hoisted.contains_key("net_I"));

    // a second pass composes: nothing left to do
    let again = jit.recompile(&graph, net, &result.function).unwrap();
    assert!(again.function.ptr_eq(&result.function));
    assert_eq!(again.hoisted_arguments, result.hoisted_arguments);
}

#[test]
fn test_integrated_update_matches_uncompiled() {
    let (direct, net) = integrating_graph();
    let (compiled, net2) = integrating_graph();
    let mut jit = jit();
    let update = jit.analyze(&compiled, net2, "update").unwrap();
    assert!(update
        .source
        .clone()
        .unwrap()
        .contains("net_V = net_int_V(net_V, t, net_I=net_I)"));

    for k in 0..3 {
        let t = RuntimeValue::Float(k as f64);
        Interpreter::with_graph(&direct)
            .call_method(net, "update", vec![t.clone()], vec![])
            .unwrap();
        update.invoke(&compiled, vec![t], vec![]).unwrap();
    }
    let a = direct.state(net, "V").unwrap().snapshot();
    let b = compiled.state(net2, "V").unwrap().snapshot();
    assert_eq!(a, b);
    assert_ne!(a, arr1(&[1.0, 2.0]).into_dyn());
}

#[test]
fn test_native_members_are_compiled() {
    let (mut graph, net, _) = network();
    graph
        .insert(
            net,
            "double",
            Member::Native(NativeFn::new("double", |args| {
                Ok(RuntimeValue::Float(args[0].expect_f64("x")? * 2.0))
            })),
        )
        .unwrap();
    graph
        .add_method(net, "f", "def f(self, x) { return self.double(x) + 1.0 }")
        .unwrap();
    let result = jit().analyze(&graph, net, "f").unwrap();
    let value = result.invoke(&graph, vec![RuntimeValue::Float(3.0)], vec![]).unwrap();
    assert_eq!(float(&value), 7.0);
}

/// Interpreter announcing an outdated ABI
struct LegacyBackend;

impl Backend for LegacyBackend {
    fn name(&self) -> &str {
        "legacy"
    }

    fn abi_version(&self) -> u32 {
        1
    }

    fn compile(&self, unit: CompileUnit) -> dyna_jit::Result<CompiledFn> {
        Interpreter.compile(unit)
    }

    fn compile_native(&self, native: &NativeFn, options: &CompileOptions) -> dyna_jit::Result<CompiledFn> {
        Interpreter.compile_native(native, options)
    }
}

#[test]
fn test_outdated_backend_is_rejected() {
    let err = Jit::new(LegacyBackend, JitSettings::default()).err().unwrap();
    assert!(matches!(
        err,
        JitError::IncompatibleBackend {
            found: 1,
            required: 2
        }
    ));
}
