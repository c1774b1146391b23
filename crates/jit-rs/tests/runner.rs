use dyna_jit::{Interpreter, Jit, ModelSpec, Runner};
use ndarray::arr1;

const LEAKY: &str = r#"{
    "root": "net",
    "seed": 1,
    "nodes": [
        { "name": "net",
          "members": {
            "V": { "state": { "value": [1.0, -1.0, 0.5] } },
            "tau": { "constant": 4.0 },
            "syn": { "child": "syn" },
            "dV": { "method": "def dV(self, V, t) { return (-V + self.syn.g.value) / self.tau }" },
            "int_V": { "integrator": { "rk2": { "var": "V", "derivative": "dV" } } },
            "update": { "method": "def update(self, t) { self.V.value = self.int_V(self.V.value, t) }" }
          },
          "steps": ["update"] },
        { "name": "syn",
          "members": {
            "g": { "state": { "value": [0.0, 0.0, 0.0] } },
            "net": { "child": "net" },
            "decay": { "method": "def decay(self, dt) { self.g.value += dt * (self.net.V.value - self.g.value) }" }
          },
          "steps": ["decay"] }
    ]
}"#;

#[test]
fn test_compiled_run_matches_uncompiled() {
    let spec = ModelSpec::from_json(LEAKY).unwrap();

    let mut direct = spec.build().unwrap();
    let mut runner = Runner::uncompiled(&direct.graph, direct.root).unwrap();
    assert_eq!(runner.len(), 2);
    runner
        .run(&direct.graph, &mut direct.context, 5, |_| {})
        .unwrap();

    let mut compiled = spec.build().unwrap();
    let mut jit = Jit::new(Interpreter, compiled.settings).unwrap();
    let mut runner = Runner::new(&mut jit, &compiled.graph, compiled.root).unwrap();
    let mut seen = Vec::new();
    runner
        .run(&compiled.graph, &mut compiled.context, 5, |k| seen.push(k))
        .unwrap();
    assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    assert_eq!(runner.executed(), 5);

    for (node, state) in [("net", "V"), ("syn", "g")] {
        let a = direct.graph.state(direct.graph.find(node).unwrap(), state).unwrap();
        let b = compiled.graph.state(compiled.graph.find(node).unwrap(), state).unwrap();
        assert_eq!(a.snapshot(), b.snapshot(), "{node}.{state}");
    }
    assert_eq!(compiled.context.args.step_index().unwrap(), 5);
}

const DELAYED: &str = r#"{
    "root": "net",
    "nodes": [
        { "name": "net",
          "members": {
            "V": { "state": { "value": [0.0, 10.0] } },
            "out": { "state": { "value": [0.0, 0.0] } },
            "update": { "method": "def update(self, V_delay_d1) { self.out.value = V_delay_d1 \n self.V.value += 1.0 }" }
          },
          "steps": ["update"] }
    ],
    "delays": [
        { "name": "V_delay", "node": "net", "state": "V", "length": 1,
          "before_t0": -5.0, "entries": [{ "name": "d1", "step": 1 }] }
    ]
}"#;

#[test]
fn test_delay_entries_are_passed_to_steps() {
    let spec = ModelSpec::from_json(DELAYED).unwrap();
    for compile in [false, true] {
        let mut model = spec.build().unwrap();
        let mut runner = if compile {
            let mut jit = Jit::new(Interpreter, model.settings).unwrap();
            Runner::new(&mut jit, &model.graph, model.root).unwrap()
        } else {
            Runner::uncompiled(&model.graph, model.root).unwrap()
        };
        runner.run(&model.graph, &mut model.context, 3, |_| {}).unwrap();

        let net = model.root;
        assert_eq!(
            model.graph.state(net, "V").unwrap().snapshot(),
            arr1(&[3.0, 13.0]).into_dyn()
        );
        // the value pushed one update before the last
        assert_eq!(
            model.graph.state(net, "out").unwrap().snapshot(),
            arr1(&[1.0, 11.0]).into_dyn(),
            "compile = {compile}"
        );
    }
}
